use std::time::Instant;

use stampede_metrics::{MetricSeriesSummary, MetricValue, TrendSummary};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl ThresholdOp {
    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            ThresholdOp::Lt => observed < bound,
            ThresholdOp::Lte => observed <= bound,
            ThresholdOp::Gt => observed > bound,
            ThresholdOp::Gte => observed >= bound,
            ThresholdOp::Eq => observed == bound,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ThresholdAgg {
    Avg,
    Min,
    Max,
    Count,
    Rate,
    Value,
    P(u32),
}

#[derive(Debug, Clone)]
pub struct ThresholdExpr {
    pub agg: ThresholdAgg,
    pub op: ThresholdOp,
    pub value: f64,
}

/// One boolean predicate over a metric sink. Re-evaluated every engine tick;
/// once it has evaluated false the threshold stays tainted for the rest of
/// the run.
#[derive(Debug)]
pub struct Threshold {
    /// Base metric name, without any submetric selector.
    pub metric: String,
    /// Submetric selector tags parsed from `metric{key:value,...}`.
    pub selector: Vec<(String, String)>,
    /// The raw expression as written in the options.
    pub source: String,
    expr: ThresholdExpr,
    pub last_result: Option<bool>,
    pub last_run_at: Option<Instant>,
    pub tainted: bool,
}

impl Threshold {
    pub fn new(metric_source: &str, expression: &str) -> Result<Threshold, ConfigError> {
        let (metric, selector) =
            parse_metric_selector(metric_source).map_err(|reason| ConfigError::InvalidThreshold {
                metric: metric_source.to_string(),
                reason,
            })?;
        let expr =
            parse_threshold_expr(expression).map_err(|reason| ConfigError::InvalidThreshold {
                metric: metric_source.to_string(),
                reason,
            })?;

        Ok(Threshold {
            metric,
            selector,
            source: expression.to_string(),
            expr,
            last_result: None,
            last_run_at: None,
            tainted: false,
        })
    }

    /// Evaluates against the current sink snapshots. While the run is live
    /// (`strict == false`) a metric with no data yet is skipped rather than
    /// failed; the final end-of-run pass is strict and treats missing data
    /// as a failure.
    pub fn evaluate(&mut self, summaries: &[MetricSeriesSummary], strict: bool) {
        let series = summaries
            .iter()
            .find(|s| s.name == self.metric && selector_matches(&self.selector, &s.tags));

        let observed = series.and_then(|s| observed_value(&s.values, &self.expr.agg));
        let result = match observed {
            Some(v) => self.expr.op.holds(v, self.expr.value),
            None if strict => false,
            None => {
                self.last_run_at = Some(Instant::now());
                return;
            }
        };

        self.last_result = Some(result);
        self.last_run_at = Some(Instant::now());
        if !result {
            self.tainted = true;
        }
    }
}

/// Builds the threshold list from the options mapping, one `Threshold` per
/// expression.
pub fn parse_thresholds(
    mapping: &std::collections::BTreeMap<String, Vec<String>>,
) -> Result<Vec<Threshold>, ConfigError> {
    let mut out = Vec::new();
    for (metric, expressions) in mapping {
        for expression in expressions {
            out.push(Threshold::new(metric, expression)?);
        }
    }
    Ok(out)
}

/// Splits `name{key:value,key2:value2}` into the base name and selector.
pub fn parse_metric_selector(
    source: &str,
) -> Result<(String, Vec<(String, String)>), String> {
    let source = source.trim();
    let Some(open) = source.find('{') else {
        if source.is_empty() {
            return Err("empty metric name".to_string());
        }
        return Ok((source.to_string(), Vec::new()));
    };

    if !source.ends_with('}') {
        return Err(format!("unterminated submetric selector: {source}"));
    }

    let name = source[..open].trim();
    if name.is_empty() {
        return Err("empty metric name".to_string());
    }

    let mut selector = Vec::new();
    for pair in source[open + 1..source.len() - 1].split(',') {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| format!("invalid selector pair `{pair}` (expected key:value)"))?;
        selector.push((k.trim().to_string(), v.trim().to_string()));
    }
    selector.sort();

    Ok((name.to_string(), selector))
}

/// Parses `agg op number`, e.g. `p(95)<200` or `rate <= 0.01`. Whitespace
/// is insignificant anywhere in the expression.
pub fn parse_threshold_expr(raw: &str) -> Result<ThresholdExpr, String> {
    let src: String = raw.split_whitespace().collect();

    let op_start = src
        .find(['<', '>', '='])
        .ok_or_else(|| format!("threshold `{raw}` has no comparison operator"))?;
    let bytes = src.as_bytes();
    let (op, op_len) = match (bytes[op_start], bytes.get(op_start + 1).copied()) {
        (b'<', Some(b'=')) => (ThresholdOp::Lte, 2),
        (b'>', Some(b'=')) => (ThresholdOp::Gte, 2),
        (b'=', Some(b'=')) => (ThresholdOp::Eq, 2),
        (b'<', _) => (ThresholdOp::Lt, 1),
        (b'>', _) => (ThresholdOp::Gt, 1),
        _ => return Err(format!("threshold `{raw}` has a stray `=` (use `==`)")),
    };

    let lhs = &src[..op_start];
    let rhs = &src[op_start + op_len..];
    if lhs.is_empty() || rhs.is_empty() {
        return Err(format!("threshold `{raw}` is missing a side of the comparison"));
    }

    let agg = parse_agg(lhs, raw)?;
    let value: f64 = rhs
        .parse()
        .map_err(|_| format!("threshold `{raw}` compares against a non-number `{rhs}`"))?;

    Ok(ThresholdExpr { agg, op, value })
}

fn parse_agg(name: &str, raw: &str) -> Result<ThresholdAgg, String> {
    if let Some(inner) = name.strip_prefix("p(").and_then(|rest| rest.strip_suffix(')')) {
        let pct: u32 = inner
            .parse()
            .map_err(|_| format!("bad percentile `{inner}` in threshold `{raw}`"))?;
        if !(1..=100).contains(&pct) {
            return Err(format!("percentile out of range in threshold `{raw}`"));
        }
        return Ok(ThresholdAgg::P(pct));
    }

    match name.to_ascii_lowercase().as_str() {
        "avg" => Ok(ThresholdAgg::Avg),
        "min" => Ok(ThresholdAgg::Min),
        "max" => Ok(ThresholdAgg::Max),
        "count" => Ok(ThresholdAgg::Count),
        "rate" => Ok(ThresholdAgg::Rate),
        "value" => Ok(ThresholdAgg::Value),
        other => Err(format!("unknown aggregation `{other}` in threshold `{raw}`")),
    }
}

fn selector_matches(selector: &[(String, String)], tags: &[(String, String)]) -> bool {
    if selector.len() != tags.len() {
        return false;
    }
    selector.iter().all(|pair| tags.contains(pair))
}

/// Which aggregations each sink shape can answer. A `None` means the
/// expression asked a sink for something it doesn't track, which the caller
/// treats the same as missing data.
fn observed_value(values: &MetricValue, agg: &ThresholdAgg) -> Option<f64> {
    match values {
        MetricValue::Counter { count } => matches!(agg, ThresholdAgg::Count | ThresholdAgg::Avg)
            .then_some(*count as f64),
        MetricValue::Gauge { value } => matches!(
            agg,
            ThresholdAgg::Value | ThresholdAgg::Avg | ThresholdAgg::Min | ThresholdAgg::Max
        )
        .then_some(*value),
        MetricValue::Rate { total, rate, .. } => match agg {
            ThresholdAgg::Rate => *rate,
            ThresholdAgg::Count => Some(*total as f64),
            _ => None,
        },
        MetricValue::Trend(trend) => trend_value(trend, agg),
    }
}

fn trend_value(trend: &TrendSummary, agg: &ThresholdAgg) -> Option<f64> {
    match agg {
        ThresholdAgg::Avg => trend.avg,
        ThresholdAgg::Min => trend.min,
        ThresholdAgg::Max => trend.max,
        ThresholdAgg::Count => Some(trend.count as f64),
        ThresholdAgg::P(50) => trend.p50,
        ThresholdAgg::P(90) => trend.p90,
        ThresholdAgg::P(95) => trend.p95,
        ThresholdAgg::P(99) => trend.p99,
        // The sink only tracks the common percentiles.
        ThresholdAgg::P(_) => None,
        ThresholdAgg::Rate | ThresholdAgg::Value => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_metrics::{MetricKind, TrendSummary};

    fn counter_summary(name: &str, count: u64, tags: Vec<(String, String)>) -> MetricSeriesSummary {
        MetricSeriesSummary {
            name: name.to_string(),
            kind: MetricKind::Counter,
            tags,
            values: MetricValue::Counter { count },
        }
    }

    #[test]
    fn parse_expr_trims_whitespace() {
        let expr = parse_threshold_expr("  p(95)  <=  200  ").unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(expr.agg, ThresholdAgg::P(95)));
        assert!(matches!(expr.op, ThresholdOp::Lte));
        assert_eq!(expr.value, 200.0);
    }

    #[test]
    fn parse_expr_rejects_out_of_range_percentiles() {
        let err = parse_threshold_expr("p(101)<1").expect_err("expected parse failure");
        assert!(err.contains("out of range"));
    }

    #[test]
    fn parse_selector_splits_tags() {
        let (name, selector) =
            parse_metric_selector("http_req_duration{status:200,method:GET}")
                .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(name, "http_req_duration");
        assert_eq!(
            selector,
            vec![
                ("method".to_string(), "GET".to_string()),
                ("status".to_string(), "200".to_string()),
            ]
        );
    }

    #[test]
    fn tainted_is_sticky() {
        let mut threshold =
            Threshold::new("iterations", "count>5").unwrap_or_else(|e| panic!("{e}"));

        threshold.evaluate(&[counter_summary("iterations", 1, Vec::new())], false);
        assert_eq!(threshold.last_result, Some(false));
        assert!(threshold.tainted);

        // A later pass can succeed but the taint remains.
        threshold.evaluate(&[counter_summary("iterations", 10, Vec::new())], false);
        assert_eq!(threshold.last_result, Some(true));
        assert!(threshold.tainted);
    }

    #[test]
    fn missing_metric_is_skipped_until_strict() {
        let mut threshold =
            Threshold::new("http_req_duration", "p(95)<200").unwrap_or_else(|e| panic!("{e}"));

        threshold.evaluate(&[], false);
        assert_eq!(threshold.last_result, None);
        assert!(!threshold.tainted);
        assert!(threshold.last_run_at.is_some());

        threshold.evaluate(&[], true);
        assert_eq!(threshold.last_result, Some(false));
        assert!(threshold.tainted);
    }

    #[test]
    fn trend_percentile_evaluation() {
        let summary = MetricSeriesSummary {
            name: "iteration_duration".to_string(),
            kind: MetricKind::Trend,
            tags: Vec::new(),
            values: MetricValue::Trend(TrendSummary {
                min: Some(1.0),
                max: Some(300.0),
                avg: Some(50.0),
                p50: Some(40.0),
                p90: Some(120.0),
                p95: Some(150.0),
                p99: Some(290.0),
                count: 100,
            }),
        };

        let mut ok = Threshold::new("iteration_duration", "p(95)<200")
            .unwrap_or_else(|e| panic!("{e}"));
        ok.evaluate(std::slice::from_ref(&summary), false);
        assert_eq!(ok.last_result, Some(true));
        assert!(!ok.tainted);

        let mut bad = Threshold::new("iteration_duration", "max<200")
            .unwrap_or_else(|e| panic!("{e}"));
        bad.evaluate(std::slice::from_ref(&summary), false);
        assert_eq!(bad.last_result, Some(false));
        assert!(bad.tainted);
    }
}
