use crate::types::{MinsarError, MinsarResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Value that asks for the default to be used
pub const AUTO: &str = "auto";

/// Processing template: `key = value` lines with `#` comments
///
/// Templates are named after the project they describe
/// (`GalapagosSenDT128.template`), so the file stem is kept as the project name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    project: Option<String>,
    entries: BTreeMap<String, String>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse template text. Later duplicates override earlier keys.
    pub fn parse(text: &str) -> MinsarResult<Self> {
        let mut entries = BTreeMap::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                log::debug!("Ignoring template line {} without '=': {}", line_no + 1, raw);
                continue;
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(MinsarError::InvalidFormat(format!(
                    "template line {} has an empty key",
                    line_no + 1
                )));
            }

            if let Some(previous) = entries.insert(key.to_string(), value.trim().to_string()) {
                log::debug!("Template key {} overridden (was '{}')", key, previous);
            }
        }

        Ok(Self {
            project: None,
            entries,
        })
    }

    /// Read a template file; the file stem becomes the project name
    pub fn read<P: AsRef<Path>>(path: P) -> MinsarResult<Self> {
        let path = path.as_ref();
        log::info!("Reading template: {}", path.display());

        let content = fs::read_to_string(path)?;
        let mut template = Self::parse(&content)?;
        template.project = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());

        log::debug!("Template {} has {} keys", path.display(), template.len());
        Ok(template)
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Raw value, `None` when the key is absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Value that is present and not `auto`
    pub fn get_explicit(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.eq_ignore_ascii_case(AUTO) && !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_explicit(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str) -> MinsarResult<Option<bool>> {
        let Some(value) = self.get_explicit(key) else {
            return Ok(None);
        };
        match value.to_lowercase().as_str() {
            "yes" | "true" | "1" | "on" => Ok(Some(true)),
            "no" | "false" | "0" | "off" | "none" => Ok(Some(false)),
            _ => Err(MinsarError::InvalidFormat(format!(
                "{} = {} is not a boolean",
                key, value
            ))),
        }
    }

    pub fn get_usize(&self, key: &str) -> MinsarResult<Option<usize>> {
        self.get_explicit(key)
            .map(|value| {
                value.parse::<usize>().map_err(|e| {
                    MinsarError::InvalidFormat(format!("{} = {}: {}", key, value, e))
                })
            })
            .transpose()
    }

    pub fn get_f64(&self, key: &str) -> MinsarResult<Option<f64>> {
        self.get_explicit(key)
            .map(|value| {
                value.parse::<f64>().map_err(|e| {
                    MinsarError::InvalidFormat(format!("{} = {}: {}", key, value, e))
                })
            })
            .transpose()
    }

    /// Comma separated value split into trimmed, non-empty items
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_explicit(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All keys below `prefix`, with the prefix stripped
    pub fn section(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key[prefix.len()..].to_string(), value.clone()))
            .collect()
    }

    /// Fill missing keys and `auto` values from a defaults template
    pub fn merge_defaults(&mut self, defaults: &Template) {
        let mut filled = 0;
        for (key, default) in &defaults.entries {
            match self.entries.get_mut(key) {
                Some(value) if value.eq_ignore_ascii_case(AUTO) => {
                    *value = default.clone();
                    filled += 1;
                }
                Some(_) => {}
                None => {
                    self.entries.insert(key.clone(), default.clone());
                    filled += 1;
                }
            }
        }
        log::debug!("Filled {} template values from defaults", filled);
    }

    /// Render as aligned `key = value` lines sorted by key
    pub fn render(&self) -> String {
        let width = self.entries.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(&format!("{:<width$} = {}\n", key, value, width = width));
        }
        out
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> MinsarResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render())?;
        log::info!("Template written to: {}", path.display());
        Ok(())
    }
}
