//! KubeVirt phase vocabularies.

use std::collections::HashSet;
use std::time::Duration;

use crate::controller::{phases, Phase};
use crate::poller::PhaseVocabulary;
use crate::tracker::InferredSpan;

/// Phase reported while a VM waits for a node.
pub const SCHEDULING: &str = "Scheduling";

/// Phase an instance reports once it runs, is ready and has an address.
pub const INSTANCE_READY: &str = "Ready";

/// VM reaches `Running`. `Scheduling` for too long, or `ErrorUnschedulable`
/// at any point, means the cluster ran out of room.
pub fn vm_ready() -> PhaseVocabulary {
    PhaseVocabulary::new(phases(["Running"]))
        .with_failure(phases([
            "CrashLoopBackOff",
            "ErrImagePull",
            "ImagePullBackOff",
            "Error",
        ]))
        .with_exhaustion(Phase::named(SCHEDULING))
        .with_immediate_exhaustion(phases(["ErrorUnschedulable"]))
}

/// VM has left `Running` after a restart request.
pub fn vm_left_running() -> PhaseVocabulary {
    let mut gone = phases([
        "Stopping",
        "Stopped",
        "Starting",
        "Provisioning",
        "Scheduling",
        "Scheduled",
        "WaitingForVolumeBinding",
    ]);
    gone.insert(Phase::Absent);
    PhaseVocabulary::new(gone).with_failure(phases(["CrashLoopBackOff", "Error"]))
}

/// VM halted and its instance gone.
pub fn vm_stopped() -> PhaseVocabulary {
    PhaseVocabulary::new(phases(["Stopped"])).with_failure(phases(["CrashLoopBackOff"]))
}

/// Instance back in service after losing its node. A `Failed` instance is
/// replaced by the VM controller, so it keeps the poll going.
pub fn instance_recovered() -> PhaseVocabulary {
    PhaseVocabulary::new(phases([INSTANCE_READY]))
}

/// Volume expansion finished.
pub fn volume_resized() -> PhaseVocabulary {
    PhaseVocabulary::new(phases(["Resized"])).with_failure(phases(["Lost"]))
}

/// Snapshot usable.
pub fn snapshot_ready() -> PhaseVocabulary {
    PhaseVocabulary::new(phases(["Ready"])).with_failure(phases(["Failed"]))
}

/// Phases of the migration object that mean the attempt failed.
pub fn migration_failed() -> HashSet<Phase> {
    phases(["Failed"])
}

/// Clone of a DataVolume from its source.
pub fn clone_span(poll_interval: Duration) -> InferredSpan {
    InferredSpan::new(
        phases(["CloneScheduled"]),
        phases(["CSICloneInProgress", "CloneInProgress"]),
        phases(["Succeeded"]),
        poll_interval,
    )
}

/// Clone phases that end tracking without a duration.
pub fn clone_failed() -> HashSet<Phase> {
    phases(["Failed"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PhaseClass;

    #[test]
    fn test_vm_vocabulary() {
        let v = vm_ready();
        assert_eq!(v.classify(&Phase::named("Running")), PhaseClass::Terminal);
        assert_eq!(v.classify(&Phase::named("ImagePullBackOff")), PhaseClass::Failure);
        assert_eq!(v.classify(&Phase::named(SCHEDULING)), PhaseClass::Exhaustion);
        assert_eq!(
            v.classify(&Phase::named("ErrorUnschedulable")),
            PhaseClass::ImmediateExhaustion
        );
        assert_eq!(v.classify(&Phase::named("Provisioning")), PhaseClass::Pending);
    }

    #[test]
    fn test_restart_vocabulary() {
        let v = vm_left_running();
        assert_eq!(v.classify(&Phase::named("Running")), PhaseClass::Pending);
        assert_eq!(v.classify(&Phase::Absent), PhaseClass::Terminal);
        assert_eq!(v.classify(&Phase::named("Stopping")), PhaseClass::Terminal);
    }

    #[test]
    fn test_recovery_vocabulary() {
        let v = instance_recovered();
        assert_eq!(v.classify(&Phase::named(INSTANCE_READY)), PhaseClass::Terminal);
        assert_eq!(v.classify(&Phase::named("Running")), PhaseClass::Pending);
        assert_eq!(v.classify(&Phase::named("Failed")), PhaseClass::Pending);
        assert_eq!(v.classify(&Phase::Absent), PhaseClass::Pending);
    }

    #[test]
    fn test_stop_vocabulary() {
        let v = vm_stopped();
        assert_eq!(v.classify(&Phase::named("Stopped")), PhaseClass::Terminal);
        assert_eq!(v.classify(&Phase::named("Stopping")), PhaseClass::Pending);
    }
}
