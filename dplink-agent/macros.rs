//! Declarative macros shared by the metric and exporter modules

/// Define a metric enum with automatic `name()` and `all()` implementations
///
/// # Example
/// ```
/// use dplink::metric_enum;
///
/// metric_enum! {
///     pub enum LaneMetric {
///         Trained => "dplink_lanes_trained",
///         Failed => "dplink_lanes_failed",
///     }
/// }
///
/// let metric = LaneMetric::Trained;
/// assert_eq!(metric.name(), "dplink_lanes_trained");
/// assert_eq!(LaneMetric::all().len(), 2);
/// ```
///
/// Expands to:
/// - An enum with Debug, Clone, Copy, PartialEq, Eq, Hash derives
/// - A `name(&self) -> &'static str` method
/// - An `all() -> Vec<Self>` method
#[macro_export]
macro_rules! metric_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $str:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }
    };
}

/// Gather metrics from an optional exporter's registry
///
/// # Example
/// ```ignore
/// // In main.rs metrics handler
/// let mut buffer = Vec::new();
/// gather_metrics!(buffer, encoder, state.tunnel_exporter, "tunnel");
/// ```
#[macro_export]
macro_rules! gather_metrics {
    ($buffer:expr, $encoder:expr, $exporter:expr, $name:literal) => {
        if let Some(ref exporter) = $exporter {
            let metric_families = exporter.registry().gather();
            if let Err(e) = $encoder.encode(&metric_families, &mut $buffer) {
                tracing::error!(concat!("Failed to encode ", $name, " metrics: {}"), e);
            }
        }
    };
}

/// Define an enum with name() and all() methods, plus custom data per variant
///
/// # Example
/// ```
/// use dplink::enum_with_data;
///
/// enum_with_data! {
///     pub enum Rate: u32 {
///         Rbr => ("RBR", 1620),
///         Hbr => ("HBR", 2700),
///     }
///     impl mbps -> u32
/// }
///
/// let rate = Rate::Hbr;
/// assert_eq!(rate.name(), "HBR");
/// assert_eq!(rate.mbps(), 2700);
/// ```
#[macro_export]
macro_rules! enum_with_data {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident: $data_type:ty {
            $($variant:ident => ($str:literal, $data:expr)),* $(,)?
        }
        impl $method:ident -> $return_type:ty
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn $method(&self) -> $return_type {
                match self {
                    $($name::$variant => $data,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }
    };
}
