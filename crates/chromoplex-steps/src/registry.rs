//! Task registry: maps the key carried in a batch payload back to the
//! static task function, so a worker process spawned by the batch
//! controller can execute it.

use chromoplex_parallel::TaskFn;

use crate::steps;

pub fn lookup_task(key: &str) -> Option<TaskFn> {
    Some(match key {
        "random_init" => steps::random_init_task,
        "relax_init" => steps::relax_init_task,
        "modeling" => steps::modeling_task,
        "hic_actdist" => steps::hic_actdist_task,
        "damid_actdist" => steps::damid_actdist_task,
        "sprite_assign" => steps::sprite_assign_task,
        "fish_assign" => steps::fish_assign_task,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::lookup_task;

    #[test]
    fn known_keys_resolve() {
        for key in [
            "random_init",
            "relax_init",
            "modeling",
            "hic_actdist",
            "damid_actdist",
            "sprite_assign",
            "fish_assign",
        ] {
            assert!(lookup_task(key).is_some(), "missing task {}", key);
        }
    }

    #[test]
    fn unknown_key_is_none() {
        assert!(lookup_task("made_up").is_none());
    }
}
