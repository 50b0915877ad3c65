use stampede_core::{Engine, GroupSnapshot, Runner as _};
use stampede_metrics::MetricValue;

/// Prints the end-of-test summary from the engine's sink snapshots: run
/// shape, per-metric lines, the group/check tree and any threshold results.
pub fn print(engine: &Engine) {
    let executor = engine.executor();

    println!();
    println!(
        "    duration: {}, iterations: {}",
        humantime::format_duration(round_millis(executor.time())),
        executor.iterations()
    );
    if executor.dropped_iterations() > 0 {
        println!("    dropped iterations: {}", executor.dropped_iterations());
    }
    println!();

    for series in engine.registry().summarize() {
        let value = match &series.values {
            MetricValue::Counter { count } => {
                if *count == 0 {
                    continue;
                }
                format!("{count}")
            }
            MetricValue::Gauge { value } => format!("{value}"),
            MetricValue::Rate { total, rate, .. } => {
                if *total == 0 {
                    continue;
                }
                format!("{:.2}%", rate.unwrap_or(0.0) * 100.0)
            }
            MetricValue::Trend(t) => {
                if t.count == 0 {
                    continue;
                }
                format!(
                    "avg={:.2}ms min={:.2}ms max={:.2}ms p(95)={:.2}ms",
                    t.avg.unwrap_or(0.0),
                    t.min.unwrap_or(0.0),
                    t.max.unwrap_or(0.0),
                    t.p95.unwrap_or(0.0),
                )
            }
        };

        let tags = if series.tags.is_empty() {
            String::new()
        } else {
            let pairs: Vec<String> = series
                .tags
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect();
            format!("{{{}}}", pairs.join(","))
        };

        println!("    {:.<28} {}", format!("{}{} ", series.name, tags), value);
    }

    let groups = engine.runner().default_group().snapshot();
    if has_checks(&groups) {
        println!();
        print_group(&groups, 1);
    }

    let thresholds = engine.thresholds_snapshot();
    if !thresholds.is_empty() {
        println!();
        for t in &thresholds {
            let mark = if t.tainted { "✗" } else { "✓" };
            println!("    {mark} {}: {}", t.metric, t.source);
        }
    }
    println!();
}

fn has_checks(group: &GroupSnapshot) -> bool {
    !group.checks.is_empty() || group.groups.iter().any(has_checks)
}

fn print_group(group: &GroupSnapshot, depth: usize) {
    let indent = "    ".repeat(depth);
    if !group.name.is_empty() {
        println!("{indent}▪ {}", group.name);
    }

    let check_indent = if group.name.is_empty() {
        indent.clone()
    } else {
        format!("{indent}  ")
    };
    for check in &group.checks {
        let total = check.passes + check.fails;
        let pct = if total > 0 {
            (check.passes as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let mark = if check.fails == 0 { "✓" } else { "✗" };
        println!(
            "{check_indent}{mark} {} ({:.1}% of {})",
            check.name, pct, total
        );
    }

    for child in &group.groups {
        print_group(child, depth + 1);
    }
}

fn round_millis(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(d.as_millis() as u64)
}
