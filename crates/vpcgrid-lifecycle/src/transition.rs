//! Router state transitions.

use vpcgrid_state::{Router, RouterState};

use crate::error::{LifecycleError, LifecycleResult};

/// Whether a router may move from `from` to `to`.
pub fn can_transition(from: RouterState, to: RouterState) -> bool {
    use RouterState::*;
    match (from, to) {
        (Destroyed, _) => false,
        // Destroy is accepted from anywhere else, including a destroy that
        // was interrupted half way.
        (_, Destroying) => true,
        (Provisioning, Running | Failed) => true,
        (Running, Stopping | Failed) => true,
        (Stopping, Stopped) => true,
        (Stopped, Provisioning) => true,
        (Destroying, Destroyed) => true,
        _ => false,
    }
}

/// Check a transition for `router`, naming it in the error.
pub fn check(router: &Router, to: RouterState) -> LifecycleResult<()> {
    if can_transition(router.state, to) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition {
            router_id: router.id.clone(),
            from: router.state,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RouterState::*;

    const ALL: [RouterState; 7] = [
        Provisioning,
        Running,
        Stopping,
        Stopped,
        Destroying,
        Destroyed,
        Failed,
    ];

    #[test]
    fn happy_path_is_legal() {
        let path = [Provisioning, Running, Stopping, Stopped, Destroying, Destroyed];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn destroy_from_everything_but_destroyed() {
        for from in ALL {
            assert_eq!(can_transition(from, Destroying), from != Destroyed, "{from}");
        }
    }

    #[test]
    fn destroyed_is_terminal() {
        for to in ALL {
            assert!(!can_transition(Destroyed, to));
        }
    }

    #[test]
    fn failure_only_from_provisioning_or_running() {
        for from in ALL {
            let expected = matches!(from, Provisioning | Running);
            assert_eq!(can_transition(from, Failed), expected, "{from}");
        }
    }

    #[test]
    fn start_only_from_stopped() {
        assert!(can_transition(Stopped, Provisioning));
        assert!(!can_transition(Running, Provisioning));
        assert!(!can_transition(Failed, Provisioning));
    }
}
