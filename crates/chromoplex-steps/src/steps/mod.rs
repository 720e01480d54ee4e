//! Pipeline steps.

mod damid;
mod fish;
mod hic;
mod modeling;
mod random_init;
mod relax_init;
mod sprite;
pub mod structgen;

pub use damid::{damid_actdist_task, DamidActdistStep};
pub use fish::{fish_assign_task, FishAssignStep};
pub use hic::{hic_actdist_task, HicActdistStep};
pub use modeling::{modeling_task, ModelingStep};
pub use random_init::{random_init_task, RandomInitStep};
pub use relax_init::{relax_init_task, RelaxInitStep};
pub use sprite::{sprite_assign_task, SpriteAssignStep};
