use super::node::NodeStamp;

/// Execution state of the remote script as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptRunState {
    #[default]
    NotRunning,
    Running,
    RerunRequested,
    StopRequested,
    CompilationError,
}

/// Whether content stamped with `stamp` belongs to a run that is no longer
/// current for its scope.
///
/// A requested rerun makes everything stale immediately, before new content
/// arrives. While a fragment run is active only nodes of the running
/// fragments can go stale; nodes outside them (or with no fragment) are left
/// alone. Outside of a run nothing is stale.
pub fn is_stale(
    stamp: &NodeStamp,
    run_state: ScriptRunState,
    current_run_id: &str,
    fragment_ids_this_run: &[String],
) -> bool {
    match run_state {
        ScriptRunState::RerunRequested => true,
        ScriptRunState::Running => {
            if fragment_ids_this_run.is_empty() {
                stamp.run_id != current_run_id
            } else {
                let in_running_fragment = stamp
                    .fragment_id
                    .as_ref()
                    .map(|id| fragment_ids_this_run.contains(id))
                    .unwrap_or(false);
                in_running_fragment && stamp.run_id != current_run_id
            }
        }
        ScriptRunState::NotRunning
        | ScriptRunState::StopRequested
        | ScriptRunState::CompilationError => false,
    }
}
