//! Analysis definitions.
//!
//! An analysis kind is declared entirely in configuration: an ordered
//! argument list handed to the tool and the output files it is expected to
//! write. Arguments of the form `{name}` are placeholders for request
//! parameters declared alongside; they are validated against the declared
//! range and rendered into the final argument list before fingerprinting.
//! The gateway never interprets the tool's vocabulary itself.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{CAPTURE_FILENAME, UPLOAD_FIELD};

/// Raw parameter values from a request, keyed by parameter name.
pub type ParameterValues = BTreeMap<String, String>;

/// Errors in an analysis definition.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("analysis name must be a non-empty [a-z0-9_-] identifier, got {0:?}")]
    InvalidName(String),

    #[error("analysis {0} declares no outputs")]
    NoOutputs(String),

    #[error("analysis {name} declares output {output:?} which is not a plain file name")]
    InvalidOutput { name: String, output: String },

    #[error("analysis {name} declares output {output:?} which is reserved by the gateway")]
    ReservedOutput { name: String, output: String },

    #[error("analysis {name} parameter {parameter:?}: {reason}")]
    InvalidParameter {
        name: String,
        parameter: String,
        reason: String,
    },

    #[error("analysis {name} uses placeholder {{{placeholder}}} with no matching parameter")]
    UnknownPlaceholder { name: String, placeholder: String },
}

/// A request parameter that fails validation. Reported to the client.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParameterError {
    #[error("{name} must be {expected}, got {value:?}")]
    Malformed {
        name: String,
        expected: &'static str,
        value: String,
    },

    #[error("{name} must be {range}, got {value}")]
    OutOfRange {
        name: String,
        range: String,
        value: String,
    },
}

/// How a parameter is parsed and rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Decimal number rendered with `precision` digits.
    Float,
    /// Whole number.
    Integer,
    /// Boolean switch; when set, renders as `flag`, otherwise the
    /// placeholder is dropped from the argument list.
    Flag,
}

fn default_precision() -> usize {
    2
}

/// A request-tunable value substituted into an analysis's arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    /// Used when the request omits the parameter. Required for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default = "default_precision", skip_serializing)]
    pub precision: usize,
    /// Argument emitted by a set flag, e.g. `-ha`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
}

impl ParameterSpec {
    /// Render the request value (or the default) as a tool argument.
    ///
    /// `Ok(None)` means the argument is omitted: an unset flag.
    pub fn render(&self, raw: Option<&str>) -> Result<Option<String>, ParameterError> {
        let raw = raw.map(str::trim).filter(|v| !v.is_empty());
        match self.kind {
            ParameterKind::Flag => {
                let on = match raw {
                    Some(v) => parse_flag(v).ok_or_else(|| self.malformed("true or false", v))?,
                    None => false,
                };
                Ok(on.then(|| self.flag.clone().unwrap_or_default()))
            }
            ParameterKind::Float => {
                let value = match raw {
                    Some(v) => v
                        .parse::<f64>()
                        .ok()
                        .filter(|x| x.is_finite())
                        .ok_or_else(|| self.malformed("a number", v))?,
                    None => self.default.unwrap_or_default(),
                };
                self.check_range(value, &value.to_string())?;
                Ok(Some(format!("{value:.prec$}", prec = self.precision)))
            }
            ParameterKind::Integer => {
                let value = match raw {
                    Some(v) => v
                        .parse::<i64>()
                        .map_err(|_| self.malformed("a whole number", v))?,
                    None => self.default.unwrap_or_default() as i64,
                };
                self.check_range(value as f64, &value.to_string())?;
                Ok(Some(value.to_string()))
            }
        }
    }

    fn check_range(&self, value: f64, shown: &str) -> Result<(), ParameterError> {
        let below = self.min.is_some_and(|min| value < min);
        let above = self.max.is_some_and(|max| value > max);
        if below || above {
            return Err(ParameterError::OutOfRange {
                name: self.name.clone(),
                range: describe_range(self.min, self.max),
                value: shown.to_string(),
            });
        }
        Ok(())
    }

    fn malformed(&self, expected: &'static str, value: &str) -> ParameterError {
        ParameterError::Malformed {
            name: self.name.clone(),
            expected,
            value: value.to_string(),
        }
    }

    /// Problems with the declaration itself, as a human-readable reason.
    fn declaration_problem(&self) -> Option<String> {
        if !is_identifier(&self.name) || self.name == UPLOAD_FIELD {
            return Some("name must be a [a-z0-9_] identifier other than the upload field".into());
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Some(format!("min {min} exceeds max {max}"));
            }
        }
        match self.kind {
            ParameterKind::Flag => match self.flag.as_deref() {
                Some(flag) if !flag.is_empty() => None,
                _ => Some("flag parameters must set `flag`".into()),
            },
            ParameterKind::Float | ParameterKind::Integer => {
                let Some(default) = self.default else {
                    return Some("numeric parameters must set `default`".into());
                };
                let whole = [Some(default), self.min, self.max]
                    .into_iter()
                    .flatten()
                    .all(|v| v.fract() == 0.0);
                if self.kind == ParameterKind::Integer && !whole {
                    return Some("integer bounds and default must be whole numbers".into());
                }
                if self.check_range(default, &default.to_string()).is_err() {
                    return Some(format!(
                        "default {default} is outside {}",
                        describe_range(self.min, self.max)
                    ));
                }
                None
            }
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn describe_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("between {min} and {max}"),
        (Some(min), None) => format!("at least {min}"),
        (None, Some(max)) => format!("at most {max}"),
        (None, None) => "a number".to_string(),
    }
}

/// The parameter name inside a `{name}` argument.
fn placeholder(arg: &str) -> Option<&str> {
    arg.strip_prefix('{')?.strip_suffix('}')
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// One configured analysis kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDefinition {
    /// Route segment, e.g. `pore_diameter`.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Arguments placed before the artifact path; `{name}` entries are
    /// parameter placeholders.
    #[serde(default)]
    pub args: Vec<String>,
    /// Expected output files; the first is the primary output.
    pub outputs: Vec<String>,
    #[serde(default)]
    pub params: Vec<ParameterSpec>,
}

impl AnalysisDefinition {
    /// The output returned by download requests and required for success.
    pub fn primary_output(&self) -> &str {
        self.outputs.first().map(String::as_str).unwrap_or_default()
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// The argument list for one request, with every placeholder replaced.
    ///
    /// Values for names that are not declared parameters are ignored.
    pub fn resolve_args(&self, values: &ParameterValues) -> Result<Vec<String>, ParameterError> {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let Some(spec) = placeholder(arg).and_then(|name| self.parameter(name)) else {
                args.push(arg.clone());
                continue;
            };
            if let Some(rendered) = spec.render(values.get(&spec.name).map(String::as_str))? {
                args.push(rendered);
            }
        }
        Ok(args)
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !name_ok {
            return Err(AnalysisError::InvalidName(self.name.clone()));
        }
        if self.outputs.is_empty() {
            return Err(AnalysisError::NoOutputs(self.name.clone()));
        }
        for output in &self.outputs {
            if !is_plain_file_name(output) {
                return Err(AnalysisError::InvalidOutput {
                    name: self.name.clone(),
                    output: output.clone(),
                });
            }
            if output == CAPTURE_FILENAME {
                return Err(AnalysisError::ReservedOutput {
                    name: self.name.clone(),
                    output: output.clone(),
                });
            }
        }

        let invalid_parameter = |parameter: &str, reason: String| AnalysisError::InvalidParameter {
            name: self.name.clone(),
            parameter: parameter.to_string(),
            reason,
        };
        let mut declared = HashSet::new();
        for param in &self.params {
            if let Some(reason) = param.declaration_problem() {
                return Err(invalid_parameter(param.name.as_str(), reason));
            }
            if !declared.insert(param.name.as_str()) {
                return Err(invalid_parameter(param.name.as_str(), "declared twice".into()));
            }
        }

        let used: HashSet<&str> = self.args.iter().filter_map(|a| placeholder(a)).collect();
        if let Some(unknown) = used.iter().find(|p| !declared.contains(*p)) {
            return Err(AnalysisError::UnknownPlaceholder {
                name: self.name.clone(),
                placeholder: unknown.to_string(),
            });
        }
        if let Some(unused) = declared.iter().find(|p| !used.contains(*p)) {
            return Err(invalid_parameter(*unused, "not referenced by any argument".into()));
        }
        Ok(())
    }
}

/// A single path component that is neither empty nor a dot entry.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, outputs: &[&str]) -> AnalysisDefinition {
        AnalysisDefinition {
            name: name.to_string(),
            description: None,
            args: vec!["-res".to_string(), "output.res".to_string()],
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            params: Vec::new(),
        }
    }

    fn surface_area() -> AnalysisDefinition {
        toml::from_str(
            r#"
name = "surface_area"
args = ["{ha}", "-sa", "{probe_radius}", "{samples}", "output.sa"]
outputs = ["output.sa"]

[[params]]
name = "ha"
kind = "flag"
flag = "-ha"

[[params]]
name = "probe_radius"
kind = "float"
default = 1.21
min = 0.1
max = 10

[[params]]
name = "samples"
kind = "integer"
default = 2000
min = 100
max = 1000000
"#,
        )
        .unwrap()
    }

    fn values(pairs: &[(&str, &str)]) -> ParameterValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn primary_output_is_first() {
        let d = def("pore_diameter", &["output.res", "output.log"]);
        assert_eq!(d.primary_output(), "output.res");
        assert!(d.validate().is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(
            def("", &["a"]).validate(),
            Err(AnalysisError::InvalidName(_))
        ));
        assert!(matches!(
            def("Pore Diameter", &["a"]).validate(),
            Err(AnalysisError::InvalidName(_))
        ));
    }

    #[test]
    fn rejects_missing_outputs() {
        assert_eq!(
            def("sa", &[]).validate(),
            Err(AnalysisError::NoOutputs("sa".to_string()))
        );
    }

    #[test]
    fn rejects_path_like_outputs() {
        for bad in ["../../etc/passwd", "sub/out.sa", "..", "."] {
            assert!(
                matches!(def("sa", &[bad]).validate(), Err(AnalysisError::InvalidOutput { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_capture_file_as_output() {
        assert!(matches!(
            def("sa", &[CAPTURE_FILENAME]).validate(),
            Err(AnalysisError::ReservedOutput { .. })
        ));
    }

    #[test]
    fn deserializes_with_defaults() {
        let d: AnalysisDefinition =
            toml::from_str("name = \"oms\"\noutputs = [\"output.oms\"]\n").unwrap();
        assert!(d.args.is_empty());
        assert!(d.params.is_empty());
        assert!(d.description.is_none());
    }

    #[test]
    fn defaults_fill_missing_parameters() {
        let d = surface_area();
        d.validate().unwrap();
        assert_eq!(
            d.resolve_args(&ParameterValues::new()).unwrap(),
            vec!["-sa", "1.21", "2000", "output.sa"]
        );
    }

    #[test]
    fn request_values_are_rendered() {
        let d = surface_area();
        let args = d
            .resolve_args(&values(&[
                ("ha", "true"),
                ("probe_radius", " 1.5 "),
                ("samples", "5000"),
                ("unrelated", "ignored"),
            ]))
            .unwrap();
        assert_eq!(args, vec!["-ha", "-sa", "1.50", "5000", "output.sa"]);
    }

    #[test]
    fn equivalent_values_render_identically() {
        let d = surface_area();
        let a = d.resolve_args(&values(&[("probe_radius", "1.5")])).unwrap();
        let b = d.resolve_args(&values(&[("probe_radius", "1.500")])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn out_of_range_and_malformed_values_are_rejected() {
        let d = surface_area();
        assert_eq!(
            d.resolve_args(&values(&[("probe_radius", "12")])).unwrap_err(),
            ParameterError::OutOfRange {
                name: "probe_radius".into(),
                range: "between 0.1 and 10".into(),
                value: "12".into(),
            }
        );
        assert!(matches!(
            d.resolve_args(&values(&[("samples", "99")])),
            Err(ParameterError::OutOfRange { .. })
        ));
        assert!(matches!(
            d.resolve_args(&values(&[("samples", "2.5")])),
            Err(ParameterError::Malformed { .. })
        ));
        assert!(matches!(
            d.resolve_args(&values(&[("probe_radius", "NaN")])),
            Err(ParameterError::Malformed { .. })
        ));
        assert!(matches!(
            d.resolve_args(&values(&[("ha", "maybe")])),
            Err(ParameterError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_inconsistent_parameter_declarations() {
        let mut d = surface_area();
        d.params[1].default = Some(20.0);
        assert!(matches!(d.validate(), Err(AnalysisError::InvalidParameter { .. })));

        let mut d = surface_area();
        d.params[2].default = Some(2000.5);
        assert!(matches!(d.validate(), Err(AnalysisError::InvalidParameter { .. })));

        let mut d = surface_area();
        d.params[0].flag = None;
        assert!(matches!(d.validate(), Err(AnalysisError::InvalidParameter { .. })));

        let mut d = surface_area();
        d.params[1].name = UPLOAD_FIELD.to_string();
        assert!(d.validate().is_err());
    }

    #[test]
    fn placeholders_and_parameters_must_match() {
        let mut d = surface_area();
        d.args.push("{chan_radius}".into());
        assert_eq!(
            d.validate(),
            Err(AnalysisError::UnknownPlaceholder {
                name: "surface_area".into(),
                placeholder: "chan_radius".into(),
            })
        );

        let mut d = surface_area();
        d.args.retain(|a| a != "{samples}");
        assert!(matches!(d.validate(), Err(AnalysisError::InvalidParameter { .. })));
    }
}
