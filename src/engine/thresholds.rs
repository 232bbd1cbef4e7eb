use crate::config::parse_duration;
use crate::types::{MetricsSnapshot, ThresholdResult};
use std::collections::BTreeMap;

/// Comparison operator of a threshold expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn from_str(s: &str) -> Option<Op> {
        match s {
            "<" => Some(Op::Lt),
            "<=" => Some(Op::Le),
            ">" => Some(Op::Gt),
            ">=" => Some(Op::Ge),
            "==" => Some(Op::Eq),
            "!=" => Some(Op::Ne),
            _ => None,
        }
    }

    fn evaluate(self, actual: f64, expected: f64) -> bool {
        match self {
            Op::Lt => actual < expected,
            Op::Le => actual <= expected,
            Op::Gt => actual > expected,
            Op::Ge => actual >= expected,
            Op::Eq => actual == expected,
            Op::Ne => actual != expected,
        }
    }
}

/// A threshold expression split into its parts; the value stays raw until
/// the metric family determines how to read it.
#[derive(Debug, Clone)]
pub struct ParsedExpression {
    pub metric: String,
    pub op: Op,
    pub value: String,
}

/// Split `<metric> <op> <value>` and check the operator. The value literal
/// is interpreted later, against the metric family.
pub fn parse_expression(expr: &str) -> Result<ParsedExpression, String> {
    let re = regex_lite::Regex::new(r"^(\w+)\s*([<>=!]+)\s*(.+)$").unwrap();
    let caps = re
        .captures(expr.trim())
        .ok_or_else(|| "expected <metric> <op> <value>".to_string())?;
    let op_str = caps.get(2).unwrap().as_str();
    let op = Op::from_str(op_str).ok_or_else(|| format!("unknown operator {op_str:?}"))?;
    Ok(ParsedExpression {
        metric: caps.get(1).unwrap().as_str().to_string(),
        op,
        value: caps.get(3).unwrap().as_str().trim().to_string(),
    })
}

/// Evaluate every expression of every metric family against a snapshot.
/// Unknown metrics or unreadable values produce a failed result with a
/// message; evaluation never aborts the run.
pub fn evaluate_thresholds(
    thresholds: &BTreeMap<String, Vec<String>>,
    snapshot: &MetricsSnapshot,
) -> Vec<ThresholdResult> {
    let mut results = Vec::new();
    for (family, exprs) in thresholds {
        for expr in exprs {
            results.push(evaluate_expression(family, expr, snapshot));
        }
    }
    results
}

fn evaluate_expression(family: &str, expr: &str, snapshot: &MetricsSnapshot) -> ThresholdResult {
    let failed = |message: String| ThresholdResult {
        metric: family.to_string(),
        expression: expr.to_string(),
        passed: false,
        value: String::new(),
        message: Some(message),
    };

    let parsed = match parse_expression(expr) {
        Ok(parsed) => parsed,
        Err(msg) => return failed(msg),
    };

    let (actual, display_value, expected) = match family {
        "http_req_duration" => {
            let us = match latency_metric(&parsed.metric, snapshot) {
                Some(us) => us,
                None => {
                    return failed(format!(
                        "unknown latency metric {:?}",
                        parsed.metric
                    ));
                }
            };
            let expected = match parse_duration(&parsed.value) {
                Ok(d) => d.as_secs_f64(),
                Err(msg) => return failed(msg),
            };
            let secs = us / 1_000_000.0;
            (secs, format!("{:.2}ms", us / 1_000.0), expected)
        }
        "http_req_failed" => {
            if parsed.metric != "rate" {
                return failed(format!(
                    "http_req_failed supports only rate, got {:?}",
                    parsed.metric
                ));
            }
            let expected = match parsed.value.parse::<f64>() {
                Ok(v) => v,
                Err(_) => return failed(format!("invalid rate literal {:?}", parsed.value)),
            };
            (
                snapshot.error_rate,
                format!("{:.4}", snapshot.error_rate),
                expected,
            )
        }
        "http_reqs" => {
            let actual = match parsed.metric.as_str() {
                "count" => snapshot.total_requests as f64,
                "rate" => snapshot.requests_per_sec,
                other => {
                    return failed(format!(
                        "http_reqs supports count and rate, got {other:?}"
                    ));
                }
            };
            let expected = match parsed.value.parse::<f64>() {
                Ok(v) => v,
                Err(_) => return failed(format!("invalid numeric literal {:?}", parsed.value)),
            };
            (actual, format!("{actual:.2}"), expected)
        }
        other => return failed(format!("unknown metric family {other:?}")),
    };

    let passed = parsed.op.evaluate(actual, expected);
    if !passed {
        tracing::warn!(family, expr, value = %display_value, "threshold breached");
    }
    ThresholdResult {
        metric: family.to_string(),
        expression: expr.to_string(),
        passed,
        value: display_value,
        message: None,
    }
}

/// Latency metric value in microseconds, or None for an unknown name.
fn latency_metric(metric: &str, snapshot: &MetricsSnapshot) -> Option<f64> {
    let latency = &snapshot.latency;
    Some(match metric {
        "p50" | "med" => latency.p50_us as f64,
        "p90" => latency.p90_us as f64,
        "p95" => latency.p95_us as f64,
        "p99" => latency.p99_us as f64,
        "min" => latency.min_us as f64,
        "max" => latency.max_us as f64,
        "avg" => latency.mean_us,
        _ => return None,
    })
}
