//! Layered environment variables for the guest process.
//!
//! Layers apply in a fixed precedence (later wins): constants, locale/debug,
//! driver variables, profile, session, one-shot overrides. Computed defaults
//! fill only keys that no layer defined.

pub mod drivers;

use std::collections::BTreeMap;
use std::fmt;

pub use drivers::{EnvContext, standard_builder};

/// Flat key/value variable set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars {
    vars: BTreeMap<String, String>,
}

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space separated `KEY=VALUE` list. Tokens without `=` or with an
    /// empty key are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut vars = Self::new();
        for token in raw.split_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                if !key.is_empty() {
                    vars.put(key, value);
                }
            }
        }
        vars
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    /// Copy every entry of `other` over this set.
    pub fn put_all(&mut self, other: &EnvVars) {
        for (key, value) in other.iter() {
            self.put(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn clear(&mut self) {
        self.vars.clear();
    }
}

impl fmt::Display for EnvVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (key, value)) in self.vars.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for EnvVars
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = EnvVars::new();
        for (key, value) in iter {
            vars.put(key, value);
        }
        vars
    }
}

/// Precedence layers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnvLayer {
    Constants,
    LocaleDebug,
    Driver,
    Profile,
    Session,
    OneShot,
    /// Defaults for keys no other layer defines. Values stored here never
    /// override a lower layer.
    Computed,
}

#[derive(Debug, Default)]
pub struct EnvironmentVariableBuilder {
    layers: BTreeMap<EnvLayer, EnvVars>,
    computed_defaults: Vec<(String, String)>,
}

impl EnvironmentVariableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(&self, layer: EnvLayer) -> Option<&EnvVars> {
        self.layers.get(&layer)
    }

    pub fn layer_mut(&mut self, layer: EnvLayer) -> &mut EnvVars {
        self.layers.entry(layer).or_default()
    }

    pub fn set(&mut self, layer: EnvLayer, key: impl Into<String>, value: impl Into<String>) {
        match layer {
            EnvLayer::Computed => self.default_if_unset(key, value),
            _ => self.layer_mut(layer).put(key, value),
        }
    }

    pub fn merge(&mut self, layer: EnvLayer, vars: &EnvVars) {
        match layer {
            EnvLayer::Computed => {
                for (key, value) in vars.iter() {
                    self.default_if_unset(key, value);
                }
            }
            _ => self.layer_mut(layer).put_all(vars),
        }
    }

    /// Install caller-supplied overrides for the next [`build`](Self::build) only.
    pub fn set_one_shot(&mut self, vars: EnvVars) {
        self.layers.insert(EnvLayer::OneShot, vars);
    }

    /// Remove a one-shot override before build, returning its value.
    pub fn take_one_shot(&mut self, key: &str) -> Option<String> {
        self.layers
            .get_mut(&EnvLayer::OneShot)
            .and_then(|vars| vars.remove(key))
    }

    /// Register a value used only when no layer defines `key`.
    pub fn default_if_unset(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.computed_defaults.push((key.into(), value.into()));
    }

    /// Layers that override, lowest first. The computed layer is excluded.
    fn overriding(&self) -> impl DoubleEndedIterator<Item = (&EnvLayer, &EnvVars)> {
        self.layers
            .iter()
            .filter(|(layer, _)| **layer != EnvLayer::Computed)
    }

    /// Registered defaults, including anything written through
    /// `layer_mut(EnvLayer::Computed)`.
    fn computed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.computed_defaults
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(self.layers.get(&EnvLayer::Computed).into_iter().flat_map(|vars| vars.iter()))
    }

    /// The layer whose value would win for `key`.
    pub fn winning_layer(&self, key: &str) -> Option<EnvLayer> {
        let layered = self
            .overriding()
            .rev()
            .find(|(_, vars)| vars.has(key))
            .map(|(layer, _)| *layer);
        layered.or_else(|| {
            self.computed()
                .any(|(k, _)| k == key)
                .then_some(EnvLayer::Computed)
        })
    }

    /// Flatten every layer. The one-shot layer is consumed so it cannot leak
    /// into a later build.
    pub fn build(&mut self) -> EnvVars {
        let one_shot = self.layers.remove(&EnvLayer::OneShot).unwrap_or_default();
        let mut resolved = EnvVars::new();
        for (_, vars) in self.overriding() {
            resolved.put_all(vars);
        }
        resolved.put_all(&one_shot);
        for (key, value) in self.computed() {
            if !resolved.has(key) {
                resolved.put(key, value);
            }
        }
        resolved
    }
}
