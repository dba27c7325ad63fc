use itertools::{iproduct, Itertools};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;


/// A sweepable fio parameter.
///
/// In the config file an option is written as a sequence of scalars, the first
/// one being the option name and the remaining ones its candidate values. A
/// sequence holding only the name declares a binary flag, which is swept as
/// absent and present.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct BenchOption {
    pub name: String,
    pub values: Vec<String>,
}

impl BenchOption {
    pub fn new<N, I, V>(name: N, values: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(|value| value.to_string()).collect(),
        }
    }

    #[cfg(test)]
    pub fn flag<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    pub fn is_flag(&self) -> bool {
        self.values.is_empty()
    }
}

fn scalar_to_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(string) => Ok(string.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(boolean) => Ok(boolean.to_string()),
        other => Err(format!("option entries must be scalars, found {other:?}")),
    }
}

impl TryFrom<Vec<Value>> for BenchOption {
    type Error = String;

    fn try_from(sequence: Vec<Value>) -> Result<Self, Self::Error> {
        let (name, values) = sequence
            .split_first()
            .ok_or_else(|| String::from("an option needs at least a name"))?;

        Ok(Self {
            name: scalar_to_string(name)?,
            values: values
                .iter()
                .map(scalar_to_string)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl From<BenchOption> for Vec<Value> {
    fn from(option: BenchOption) -> Self {
        std::iter::once(option.name)
            .chain(option.values)
            .map(Value::String)
            .collect()
    }
}

/// Per-run replacement of an option's candidate values, e.g. from `--set bs="4k 8k"`
#[derive(Clone, Debug, Default)]
pub struct Overrides(BTreeMap<String, String>);

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.0.insert(name.into(), value.into());
    }

    /// override names matching none of `options`
    pub fn unknown<'a>(&'a self, options: &[BenchOption]) -> Vec<&'a str> {
        self.0
            .keys()
            .filter(|name| !options.iter().any(|option| option.name == **name))
            .map(String::as_str)
            .collect()
    }

    /// values replacing the candidates of `name`, empty overrides are ignored
    fn values_for(&self, name: &str) -> Option<Vec<String>> {
        self.0
            .get(name)
            .filter(|value| !value.trim().is_empty())
            .map(|value| {
                value
                    .split(' ')
                    .filter(|part| !part.is_empty())
                    .map(String::from)
                    .collect()
            })
    }
}

impl FromIterator<(String, String)> for Overrides {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut overrides = Self::new();
        for (name, value) in iter {
            overrides.insert(name, value);
        }
        overrides
    }
}

/// parse a `name=value` command line assignment
pub fn parse_assignment(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{input}'")),
    }
}

/// Expand `options` into every job command of the sweep.
///
/// The first option varies slowest. A flag yields the command without the flag
/// before the one with it.
pub fn generate(base: &str, options: &[BenchOption], overrides: &Overrides) -> Vec<String> {
    for name in overrides.unknown(options) {
        warn!("Override {name} matches no declared option, ignoring it");
    }

    options
        .iter()
        .fold(vec![base.to_string()], |partials, option| {
            let option = match overrides.values_for(&option.name) {
                Some(values) => Cow::Owned(BenchOption::new(option.name.as_str(), values)),
                None => Cow::Borrowed(option),
            };

            if option.is_flag() {
                partials
                    .into_iter()
                    .flat_map(|partial| {
                        let with_flag = format!("{partial} --{}", option.name);
                        [partial, with_flag]
                    })
                    .collect()
            } else {
                iproduct!(partials.into_iter(), option.values.iter())
                    .map(|(partial, value)| format!("{partial} --{}={value}", option.name))
                    .collect()
            }
        })
}

/// Order insensitive form of a job command, its tokens sorted lexicographically
pub fn normalize(command: &str) -> String {
    command.split_whitespace().sorted().join(" ")
}

/// fio sweep used when the config does not declare any options
pub fn default_options() -> Vec<BenchOption> {
    vec![
        BenchOption::new("name", ["test"]),
        BenchOption::new("filename", ["test"]),
        BenchOption::new("ioengine", ["libaio"]),
        BenchOption::new("readwrite", ["randread", "randwrite", "randrw"]),
        BenchOption::new("direct", ["1"]),
        BenchOption::new("bs", ["4k"]),
        BenchOption::new("size", ["1G"]),
        BenchOption::new("numjobs", ["1", "2", "4"]),
        BenchOption::new("runtime", [90]),
        BenchOption::new("iodepth", [16]),
    ]
}
