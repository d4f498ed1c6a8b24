//! Judge functions: reduce an evaluation window to a value and a verdict

use crate::models::{Exp, HistoryPoint, Operator};

/// Parsed `func` of an expression
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JudgeFunc {
    /// Every point satisfies the predicate; left value is the newest point
    All,
    Max,
    Min,
    Sum,
    Avg,
    /// Newest minus each older point, first hit wins
    Diff,
    /// Percentage form of `Diff`, zero denominators skipped
    PDiff,
    /// Window holds no non-NaN value
    Nodata,
    /// Newest point outside `mean ± multiplier * stddev`
    Stddev { multiplier: i64 },
    /// Predicate true for at least `times` points
    Happen { times: i64 },
    /// Window average minus the average `offset` seconds earlier
    CAvg { offset: i64 },
    CAvgAbs { offset: i64 },
    /// Relative change in percent
    CAvgRate { offset: i64 },
    CAvgRateAbs { offset: i64 },
}

/// Result of applying a function to a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Value compared against the threshold (NaN when nothing qualified)
    pub left: f64,
    pub triggered: bool,
}

impl Evaluation {
    fn not_triggered(left: f64) -> Self {
        Self {
            left,
            triggered: false,
        }
    }

    fn check(left: f64, optr: Operator, threshold: f64) -> Self {
        Self {
            left,
            triggered: optr.check(left, threshold),
        }
    }
}

fn first_param(exp: &Exp) -> Result<i64, String> {
    exp.params
        .first()
        .copied()
        .ok_or_else(|| format!("func {} of {} needs a parameter", exp.func, exp.metric))
}

impl JudgeFunc {
    /// Resolve `func` and its `params`.
    ///
    /// Unknown names and missing parameters are rule errors.
    pub fn parse(exp: &Exp) -> Result<Self, String> {
        let func = match exp.func.as_str() {
            "all" => JudgeFunc::All,
            "max" => JudgeFunc::Max,
            "min" => JudgeFunc::Min,
            "sum" => JudgeFunc::Sum,
            "avg" => JudgeFunc::Avg,
            "diff" => JudgeFunc::Diff,
            "pdiff" => JudgeFunc::PDiff,
            "nodata" => JudgeFunc::Nodata,
            "stddev" => JudgeFunc::Stddev {
                multiplier: first_param(exp)?,
            },
            "happen" => {
                let times = first_param(exp)?;
                if times < 1 {
                    return Err(format!("happen of {} needs a positive count", exp.metric));
                }
                JudgeFunc::Happen { times }
            }
            "c_avg" => JudgeFunc::CAvg {
                offset: first_param(exp)?,
            },
            "c_avg_abs" => JudgeFunc::CAvgAbs {
                offset: first_param(exp)?,
            },
            "c_avg_rate" => JudgeFunc::CAvgRate {
                offset: first_param(exp)?,
            },
            "c_avg_rate_abs" => JudgeFunc::CAvgRateAbs {
                offset: first_param(exp)?,
            },
            other => return Err(format!("unknown func {:?}", other)),
        };
        Ok(func)
    }

    /// Seconds back to the comparison window, for the `c_avg` family
    pub fn comparison_offset(&self) -> Option<i64> {
        match self {
            JudgeFunc::CAvg { offset }
            | JudgeFunc::CAvgAbs { offset }
            | JudgeFunc::CAvgRate { offset }
            | JudgeFunc::CAvgRateAbs { offset } => Some(*offset),
            _ => None,
        }
    }

    /// Apply to a newest-first window.
    ///
    /// `compare` is the comparison-window average of the `c_avg` family;
    /// without it those functions never trigger.
    pub fn evaluate(
        &self,
        window: &[HistoryPoint],
        optr: Operator,
        threshold: f64,
        compare: Option<f64>,
    ) -> Evaluation {
        let values: Vec<f64> = window.iter().map(|p| p.value).filter(|v| !v.is_nan()).collect();

        if let JudgeFunc::Nodata = self {
            return Evaluation {
                left: f64::NAN,
                triggered: values.is_empty(),
            };
        }
        let Some(&newest) = values.first() else {
            return Evaluation::not_triggered(f64::NAN);
        };

        match *self {
            JudgeFunc::All => Evaluation {
                left: newest,
                triggered: values.iter().all(|v| optr.check(*v, threshold)),
            },
            JudgeFunc::Max => Evaluation::check(
                values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                optr,
                threshold,
            ),
            JudgeFunc::Min => Evaluation::check(
                values.iter().copied().fold(f64::INFINITY, f64::min),
                optr,
                threshold,
            ),
            JudgeFunc::Sum => Evaluation::check(values.iter().sum(), optr, threshold),
            JudgeFunc::Avg => Evaluation::check(mean(&values), optr, threshold),
            JudgeFunc::Diff => first_hit(values[1..].iter().map(|old| newest - old), optr, threshold),
            JudgeFunc::PDiff => first_hit(
                values[1..]
                    .iter()
                    .filter(|old| **old != 0.0)
                    .map(|old| (newest - old) / old * 100.0),
                optr,
                threshold,
            ),
            JudgeFunc::Happen { times } => {
                let mut count = 0;
                for v in &values {
                    if optr.check(*v, threshold) {
                        count += 1;
                        if count >= times {
                            return Evaluation {
                                left: *v,
                                triggered: true,
                            };
                        }
                    }
                }
                Evaluation::not_triggered(newest)
            }
            JudgeFunc::Stddev { multiplier } => {
                if values.len() < 2 {
                    return Evaluation::not_triggered(newest);
                }
                let avg = mean(&values);
                let std = (values.iter().map(|v| (v - avg).powi(2)).sum::<f64>()
                    / values.len() as f64)
                    .sqrt();
                let band = std * multiplier as f64;
                Evaluation {
                    left: newest,
                    triggered: newest < avg - band || newest > avg + band,
                }
            }
            JudgeFunc::CAvg { .. }
            | JudgeFunc::CAvgAbs { .. }
            | JudgeFunc::CAvgRate { .. }
            | JudgeFunc::CAvgRateAbs { .. } => {
                let Some(cmp) = compare.filter(|c| !c.is_nan()) else {
                    return Evaluation::not_triggered(f64::NAN);
                };
                let delta = mean(&values) - cmp;
                let left = match self {
                    JudgeFunc::CAvg { .. } => delta,
                    JudgeFunc::CAvgAbs { .. } => delta.abs(),
                    JudgeFunc::CAvgRate { .. } => delta / cmp.abs() * 100.0,
                    _ => (delta / cmp).abs() * 100.0,
                };
                Evaluation::check(left, optr, threshold)
            }
            JudgeFunc::Nodata => unreachable!("handled above"),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn first_hit(candidates: impl Iterator<Item = f64>, optr: Operator, threshold: f64) -> Evaluation {
    let mut last = f64::NAN;
    for left in candidates {
        if optr.check(left, threshold) {
            return Evaluation {
                left,
                triggered: true,
            };
        }
        last = left;
    }
    Evaluation::not_triggered(last)
}

/// Human-readable rendering of one expression
pub fn describe(exp: &Exp, alert_duration: i64) -> String {
    let params = format!(
        "[{}]",
        exp.params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    );
    match exp.func.as_str() {
        "stddev" => format!("{} ({},{}s) {}", exp.metric, exp.func, alert_duration, params),
        "happen" => format!(
            "{} ({},{}s) {} {} {}",
            exp.metric, exp.func, alert_duration, params, exp.optr, exp.threshold
        ),
        _ => format!(
            "{}({},{}s) {} {}",
            exp.metric, exp.func, alert_duration, exp.optr, exp.threshold
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp(func: &str, params: Vec<i64>, optr: Operator, threshold: f64) -> Exp {
        Exp {
            metric: "cpu_util".to_string(),
            func: func.to_string(),
            params,
            optr,
            threshold,
        }
    }

    /// Newest first
    fn window(values: &[f64]) -> Vec<HistoryPoint> {
        let n = values.len() as i64;
        values
            .iter()
            .enumerate()
            .map(|(i, v)| HistoryPoint::new(1000 + n - i as i64, *v))
            .collect()
    }

    fn eval(func: &str, params: Vec<i64>, optr: Operator, threshold: f64, values: &[f64]) -> Evaluation {
        JudgeFunc::parse(&exp(func, params, optr, threshold))
            .unwrap()
            .evaluate(&window(values), optr, threshold, None)
    }

    #[test]
    fn test_parse_rejects_unknown_and_missing_params() {
        assert!(JudgeFunc::parse(&exp("median", vec![], Operator::Gt, 1.0)).is_err());
        assert!(JudgeFunc::parse(&exp("happen", vec![], Operator::Gt, 1.0)).is_err());
        assert!(JudgeFunc::parse(&exp("happen", vec![0], Operator::Gt, 1.0)).is_err());
        assert!(JudgeFunc::parse(&exp("c_avg", vec![], Operator::Gt, 1.0)).is_err());
        assert_eq!(
            JudgeFunc::parse(&exp("c_avg_rate", vec![86400], Operator::Gt, 1.0))
                .unwrap()
                .comparison_offset(),
            Some(86400)
        );
    }

    #[test]
    fn test_all_uses_newest_as_left_value() {
        let e = eval("all", vec![], Operator::Gt, 80.0, &[90.0, 85.0, 81.0]);
        assert_eq!(e, Evaluation { left: 90.0, triggered: true });

        let e = eval("all", vec![], Operator::Gt, 80.0, &[90.0, 70.0]);
        assert_eq!(e, Evaluation { left: 90.0, triggered: false });
    }

    #[test]
    fn test_aggregates() {
        let values = [1.0, 5.0, 3.0];
        assert_eq!(eval("max", vec![], Operator::Ge, 5.0, &values).left, 5.0);
        assert_eq!(eval("min", vec![], Operator::Le, 1.0, &values).left, 1.0);
        assert_eq!(eval("sum", vec![], Operator::Eq, 9.0, &values).left, 9.0);
        let avg = eval("avg", vec![], Operator::Eq, 3.0, &values);
        assert_eq!(avg.left, 3.0);
        assert!(avg.triggered);
    }

    #[test]
    fn test_diff_and_pdiff() {
        let d = eval("diff", vec![], Operator::Gt, 15.0, &[50.0, 40.0, 30.0]);
        assert_eq!(d, Evaluation { left: 20.0, triggered: true });

        let single = eval("diff", vec![], Operator::Gt, 0.0, &[50.0]);
        assert!(!single.triggered);
        assert!(single.left.is_nan());

        let p = eval("pdiff", vec![], Operator::Ge, 100.0, &[40.0, 0.0, 20.0]);
        assert_eq!(p, Evaluation { left: 100.0, triggered: true });
    }

    #[test]
    fn test_happen_counts_matches() {
        let e = eval("happen", vec![2], Operator::Gt, 80.0, &[70.0, 85.0, 60.0, 95.0]);
        assert_eq!(e, Evaluation { left: 95.0, triggered: true });

        let e = eval("happen", vec![3], Operator::Gt, 80.0, &[70.0, 85.0, 60.0, 95.0]);
        assert!(!e.triggered);
        assert_eq!(e.left, 70.0);
    }

    #[test]
    fn test_stddev_band() {
        // mean 12, population std 4.0
        let e = eval("stddev", vec![1], Operator::Gt, 0.0, &[18.0, 10.0, 10.0, 10.0]);
        assert!(e.triggered);
        assert_eq!(e.left, 18.0);

        let e = eval("stddev", vec![2], Operator::Gt, 0.0, &[18.0, 10.0, 10.0, 10.0]);
        assert!(!e.triggered);

        assert!(!eval("stddev", vec![1], Operator::Gt, 0.0, &[18.0]).triggered);
    }

    #[test]
    fn test_c_avg_family() {
        let window = window(&[120.0, 100.0, 110.0]);
        let cases = [
            ("c_avg", 10.0),
            ("c_avg_abs", 10.0),
            ("c_avg_rate", 10.0),
            ("c_avg_rate_abs", 10.0),
        ];
        for (func, expected) in cases {
            let f = JudgeFunc::parse(&exp(func, vec![3600], Operator::Ge, 10.0)).unwrap();
            let e = f.evaluate(&window, Operator::Ge, 10.0, Some(100.0));
            assert!((e.left - expected).abs() < 1e-9, "{func}: {}", e.left);
            assert!(e.triggered, "{func}");
        }

        let rate = JudgeFunc::CAvgRate { offset: 60 }.evaluate(&window, Operator::Lt, 0.0, Some(-200.0));
        assert!((rate.left - 155.0).abs() < 1e-9);
        let rate_abs =
            JudgeFunc::CAvgRateAbs { offset: 60 }.evaluate(&window, Operator::Gt, 0.0, Some(-200.0));
        assert!((rate_abs.left - 155.0).abs() < 1e-9);

        let missing = JudgeFunc::CAvg { offset: 60 }.evaluate(&window, Operator::Gt, 0.0, None);
        assert!(missing.left.is_nan());
        assert!(!missing.triggered);
    }

    #[test]
    fn test_nodata_and_nan_windows() {
        let nan_window = window(&[f64::NAN, f64::NAN]);
        let nodata = JudgeFunc::Nodata.evaluate(&nan_window, Operator::Gt, 0.0, None);
        assert!(nodata.triggered);
        assert!(!JudgeFunc::Nodata
            .evaluate(&window(&[1.0]), Operator::Gt, 0.0, None)
            .triggered);

        let all = JudgeFunc::All.evaluate(&nan_window, Operator::Gt, 0.0, None);
        assert!(!all.triggered);
        assert!(all.left.is_nan());
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&exp("all", vec![], Operator::Gt, 80.0), 60),
            "cpu_util(all,60s) > 80"
        );
        assert_eq!(
            describe(&exp("happen", vec![3], Operator::Ge, 90.5), 300),
            "cpu_util (happen,300s) [3] >= 90.5"
        );
        assert_eq!(
            describe(&exp("stddev", vec![3, 4], Operator::Gt, 0.0), 0),
            "cpu_util (stddev,0s) [3 4]"
        );
    }
}
