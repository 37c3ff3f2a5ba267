use crate::metric_enum;

metric_enum! {
    pub enum TunnelMetric {
        AllocatedBw => "dptun_allocated_bw_mbps",
        RequiredBw => "dptun_required_bw_mbps",
        BwAllocEnabled => "dptun_bw_alloc_enabled",
        BwAllocErrors => "dptun_bw_alloc_errors",
        GroupAvailableBw => "dptun_group_available_bw_mbps",
        GroupAllocatedBw => "dptun_group_allocated_bw_mbps",
    }
}

impl TunnelMetric {
    /// Labelled by group rather than by tunnel
    pub fn is_group_metric(&self) -> bool {
        matches!(
            self,
            TunnelMetric::GroupAvailableBw | TunnelMetric::GroupAllocatedBw
        )
    }

    pub fn help(&self) -> &'static str {
        match self {
            TunnelMetric::AllocatedBw => "BW allocated to the DP tunnel in Mb/s",
            TunnelMetric::RequiredBw => "Committed BW requirement of the tunnel's streams in Mb/s",
            TunnelMetric::BwAllocEnabled => "BW allocation mode enabled",
            TunnelMetric::BwAllocErrors => "Sticky BW allocation error",
            TunnelMetric::GroupAvailableBw => "BW available to the tunnel group in Mb/s",
            TunnelMetric::GroupAllocatedBw => "BW allocated across the tunnel group in Mb/s",
        }
    }
}
