//! The design of experiments: the planned set of configurations to explore.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

/// A configuration: knob name to stringified value, canonically ordered by
/// knob name.
pub type Configuration = BTreeMap<String, String>;

/// The canonical fingerprint of a configuration, used as the DoE key.
pub fn fingerprint(configuration: &Configuration) -> String {
    let mut out = String::new();
    for (name, value) in configuration {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(name);
        out.push('=');
        out.push_str(value);
    }
    out
}

/// One planned exploration: a configuration and how many observations of it
/// are still required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoeEntry {
    /// The configuration to explore.
    pub configuration: Configuration,
    /// Remaining observations before the entry is satisfied.
    pub counter: u32,
}

/// The design of experiments produced by the DoE plugin.
///
/// An ordered map from configuration fingerprint to its remaining
/// exploration counter, with a wrap-around cursor for round-robin dispatch.
/// The live set shrinks as counters reach zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Doe {
    /// The live set of explorations still required.
    pub required_explorations: BTreeMap<String, DoeEntry>,
    #[serde(skip)]
    cursor: Option<String>,
}

impl Doe {
    /// Builds a DoE from configurations, each requiring `counter`
    /// observations. Entries with a zero counter are discarded.
    pub fn new(configurations: impl IntoIterator<Item = Configuration>, counter: u32) -> Self {
        let required_explorations = configurations
            .into_iter()
            .filter(|_| counter > 0)
            .map(|configuration| {
                (
                    fingerprint(&configuration),
                    DoeEntry {
                        configuration,
                        counter,
                    },
                )
            })
            .collect();
        Self {
            required_explorations,
            cursor: None,
        }
    }

    /// Whether at least one exploration is still required.
    pub fn is_valid(&self) -> bool {
        !self.required_explorations.is_empty()
    }

    /// Returns the next configuration to dispatch and advances the cursor,
    /// wrapping around the live set. `None` on an exhausted DoE.
    pub fn next(&mut self) -> Option<Configuration> {
        let after = match &self.cursor {
            Some(key) => self
                .required_explorations
                .range::<String, _>((Bound::Excluded(key.clone()), Bound::Unbounded))
                .next(),
            None => None,
        };
        let (key, entry) = after.or_else(|| self.required_explorations.iter().next())?;
        let configuration = entry.configuration.clone();
        self.cursor = Some(key.clone());
        Some(configuration)
    }

    /// Records one observation of `fingerprint`, decrementing its counter
    /// and dropping the entry once satisfied. Returns the remaining count,
    /// or `None` for fingerprints outside the live set.
    pub fn record_observation(&mut self, fingerprint: &str) -> Option<u32> {
        let entry = self.required_explorations.get_mut(fingerprint)?;
        entry.counter = entry.counter.saturating_sub(1);
        let remaining = entry.counter;
        if remaining == 0 {
            self.required_explorations.remove(fingerprint);
        }
        Some(remaining)
    }

    /// Drops every entry and resets the cursor.
    pub fn clear(&mut self) {
        self.required_explorations.clear();
        self.cursor = None;
    }
}

impl PartialEq for Doe {
    fn eq(&self, other: &Self) -> bool {
        // The cursor is dispatch bookkeeping, not identity.
        self.required_explorations == other.required_explorations
    }
}
