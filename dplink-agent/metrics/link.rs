use crate::metric_enum;

metric_enum! {
    pub enum LinkMetric {
        Negotiations => "dplink_negotiations_total",
        NegotiationFailures => "dplink_negotiation_failures_total",
        SolverIterations => "dplink_solver_iterations",
        TrainingAttempts => "dplink_training_attempts_total",
        TrainingFailures => "dplink_training_failures_total",
        ReconfigurationRequests => "dplink_reconfiguration_requests_total",
        CommitErrors => "dplink_tunnel_commit_errors_total",
    }
}

impl LinkMetric {
    /// Labelled by AUX channel
    pub fn is_per_link(&self) -> bool {
        matches!(
            self,
            LinkMetric::TrainingAttempts | LinkMetric::TrainingFailures
        )
    }
}
