use serde::Serialize;
use std::fmt::Write as _;

use crate::MetricsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// Ordered label set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.0.push((name.to_string(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn render(&self, out: &mut String) {
        if self.0.is_empty() {
            return;
        }
        out.push('{');
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(name);
            out.push_str("=\"");
            for c in value.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        out.push('}');
    }
}

/// One `name{labels} value` line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub name: String,
    pub labels: Labels,
    pub value: f64,
}

#[derive(Debug, Clone)]
struct Family {
    name: String,
    help: String,
    kind: MetricKind,
    samples: Vec<Sample>,
}

/// Outcome of one job, verification or restore test, as metric families
#[derive(Debug, Clone, Default)]
pub struct StatusRecord {
    families: Vec<Family>,
}

impl StatusRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge(&mut self, name: &str, help: &str, labels: &Labels, value: f64) -> &mut Self {
        self.push(name, help, MetricKind::Gauge, labels, value)
    }

    pub fn counter(&mut self, name: &str, help: &str, labels: &Labels, value: f64) -> &mut Self {
        self.push(name, help, MetricKind::Counter, labels, value)
    }

    fn push(
        &mut self,
        name: &str,
        help: &str,
        kind: MetricKind,
        labels: &Labels,
        value: f64,
    ) -> &mut Self {
        let sample = Sample {
            name: name.to_string(),
            labels: labels.clone(),
            value,
        };
        match self.families.iter_mut().find(|f| f.name == name) {
            Some(family) => family.samples.push(sample),
            None => self.families.push(Family {
                name: name.to_string(),
                help: help.to_string(),
                kind,
                samples: vec![sample],
            }),
        }
        self
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.families.iter().flat_map(|f| f.samples.iter())
    }

    /// First value recorded under `name`
    pub fn value(&self, name: &str) -> Option<f64> {
        self.samples().find(|s| s.name == name).map(|s| s.value)
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for family in &self.families {
            let _ = writeln!(out, "# HELP {} {}", family.name, family.help);
            let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind.as_str());
            for sample in &family.samples {
                out.push_str(&sample.name);
                sample.labels.render(&mut out);
                out.push(' ');
                out.push_str(&format_value(sample.value));
                out.push('\n');
            }
        }
        out
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let inf = if value > 0.0 { "+Inf" } else { "-Inf" };
        inf.to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Parses exposition text back into samples. Comment lines are skipped.
pub fn parse(text: &str) -> Result<Vec<Sample>, MetricsError> {
    let mut samples = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        samples.push(parse_line(line).map_err(|reason| MetricsError::Parse {
            line: index + 1,
            reason,
        })?);
    }
    Ok(samples)
}

fn parse_line(line: &str) -> Result<Sample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| "missing value".to_string())?;
    let name = &line[..name_end];
    if name.is_empty() {
        return Err("missing metric name".to_string());
    }

    let mut labels = Labels::new();
    let mut rest = &line[name_end..];
    if rest.starts_with('{') {
        let mut chars = rest[1..].char_indices();
        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut escaped = false;
        let mut closed_at = None;

        while let Some((i, c)) = chars.next() {
            if in_value {
                if escaped {
                    value.push(match c {
                        'n' => '\n',
                        other => other,
                    });
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    labels = labels.with(key.trim(), std::mem::take(&mut value));
                    key.clear();
                    in_value = false;
                } else {
                    value.push(c);
                }
                continue;
            }
            match c {
                '}' => {
                    closed_at = Some(i + 1);
                    break;
                }
                ',' | ' ' => {}
                '=' => match chars.next() {
                    Some((_, '"')) => in_value = true,
                    _ => return Err("label value must be quoted".to_string()),
                },
                c => key.push(c),
            }
        }

        let closed_at = closed_at.ok_or_else(|| "unterminated label set".to_string())?;
        rest = &rest[1 + closed_at..];
    }

    let value_str = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| "missing value".to_string())?;
    let value = match value_str {
        "NaN" => f64::NAN,
        "+Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        other => other
            .parse::<f64>()
            .map_err(|_| format!("invalid value '{other}'"))?,
    };

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
    })
}
