use std::{fmt, str::FromStr};

use snafu::Snafu;

/// Error returned when a metric name cannot be parsed.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ParseMetricNameError {
    /// The metric portion of the name was empty.
    #[snafu(display("metric name must not be empty"))]
    EmptyMetric,

    /// The instance portion was opened with `[` but never closed, or was empty.
    #[snafu(display("malformed instance in metric name '{}'", input))]
    MalformedInstance {
        /// The name that failed to parse.
        input: String,
    },
}

/// The name of a single exported value.
///
/// A metric name is made up of the metric itself (`requests.count`) and, for instanced metrics, the instance
/// (`workerA`) along with the instance domain (`pool`) the instance belongs to. Two names are equal only when all three
/// parts are equal.
///
/// The textual form is `metric` or `metric[instance]`. When parsed from text, the instance domain of an instanced
/// name defaults to the metric itself.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MetricName {
    metric: String,
    instance: Option<String>,
    instance_domain: Option<String>,
}

impl MetricName {
    /// Creates a name for a metric without an instance.
    pub fn new<M: Into<String>>(metric: M) -> Self {
        Self {
            metric: metric.into(),
            instance: None,
            instance_domain: None,
        }
    }

    /// Creates a name for one instance of a metric, with the instance living in the given instance domain.
    pub fn with_instance<M, I, D>(metric: M, instance: I, instance_domain: D) -> Self
    where
        M: Into<String>,
        I: Into<String>,
        D: Into<String>,
    {
        Self {
            metric: metric.into(),
            instance: Some(instance.into()),
            instance_domain: Some(instance_domain.into()),
        }
    }

    /// Returns the metric portion of the name.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Returns the instance, if any.
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Returns the instance domain tag, if any.
    ///
    /// This is always present when the name has an instance, and always absent otherwise.
    pub fn instance_domain(&self) -> Option<&str> {
        self.instance_domain.as_deref()
    }

    /// Returns `true` if this name refers to one instance of a metric.
    pub fn has_instance(&self) -> bool {
        self.instance.is_some()
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}[{}]", self.metric, instance),
            None => f.write_str(&self.metric),
        }
    }
}

impl FromStr for MetricName {
    type Err = ParseMetricNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (metric, instance) = match s.split_once('[') {
            Some((metric, rest)) => match rest.strip_suffix(']') {
                Some(instance) if !instance.is_empty() && !instance.contains(['[', ']']) => (metric, Some(instance)),
                _ => return MalformedInstance { input: s }.fail(),
            },
            None => (s, None),
        };

        if metric.is_empty() {
            return EmptyMetric.fail();
        }

        Ok(match instance {
            Some(instance) => Self::with_instance(metric, instance, metric),
            None => Self::new(metric),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn equality_covers_all_parts() {
        let a = MetricName::with_instance("queue.depth", "workerA", "pool");
        let b = MetricName::with_instance("queue.depth", "workerA", "other");
        let c = MetricName::with_instance("queue.depth", "workerB", "pool");

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, MetricName::new("queue.depth"));
        assert_eq!(a, a.clone());

        let set: HashSet<_> = [a.clone(), b, c, a].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn parse_plain_and_instanced() {
        let plain: MetricName = "requests.count".parse().unwrap();
        assert_eq!(plain, MetricName::new("requests.count"));
        assert!(!plain.has_instance());
        assert_eq!(plain.instance_domain(), None);

        let instanced: MetricName = "queue.depth[workerA]".parse().unwrap();
        assert_eq!(instanced.metric(), "queue.depth");
        assert_eq!(instanced.instance(), Some("workerA"));
        assert_eq!(instanced.instance_domain(), Some("queue.depth"));
        assert_eq!(instanced.to_string(), "queue.depth[workerA]");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!("".parse::<MetricName>(), Err(ParseMetricNameError::EmptyMetric));
        assert_eq!("[a]".parse::<MetricName>(), Err(ParseMetricNameError::EmptyMetric));
        assert!(matches!(
            "a[b".parse::<MetricName>(),
            Err(ParseMetricNameError::MalformedInstance { .. })
        ));
        assert!(matches!(
            "a[]".parse::<MetricName>(),
            Err(ParseMetricNameError::MalformedInstance { .. })
        ));
        assert!(matches!(
            "a[b]]".parse::<MetricName>(),
            Err(ParseMetricNameError::MalformedInstance { .. })
        ));
    }
}
