//! Typed access to the launcher's preferences.

use std::sync::Arc;

use tracing::debug;

use crate::config::PreferenceDefaults;
use crate::host::{PrefScope, PrefValue, PreferenceStore};

/// Preference: start and own a Tor process.
pub const PREF_START_TOR: &str = "startTor";
/// Preference: show network settings before connecting to the network.
pub const PREF_PROMPT_AT_STARTUP: &str = "promptAtStartup";
/// Preference: configure an existing Tor process instead of starting one.
pub const PREF_ONLY_CONFIGURE_TOR: &str = "onlyConfigureTor";
/// Preference: which default bridges to use.
pub const PREF_DEFAULT_BRIDGE_TYPE: &str = "defaultBridgeType";

/// The launcher's preferences, backed by a [`PreferenceStore`], with
/// defaults from the configuration.
#[derive(Clone)]
pub struct Preferences {
    /// Where stored values live.
    store: Arc<dyn PreferenceStore>,
    /// Values to use when nothing is stored.
    defaults: PreferenceDefaults,
}

impl std::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preferences")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl Preferences {
    /// Wrap `store`, falling back to `defaults`.
    pub fn new(store: Arc<dyn PreferenceStore>, defaults: PreferenceDefaults) -> Self {
        Preferences { store, defaults }
    }

    /// Return the boolean stored for `key`, or `default`.
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.store.get(key) {
            Some(PrefValue::Bool(b)) => b,
            Some(other) => {
                debug!("Ignoring non-boolean value {:?} for {}", other, key);
                default
            }
            None => default,
        }
    }

    /// Return whether we should start a Tor process.
    pub fn start_tor(&self) -> bool {
        self.get_bool(PREF_START_TOR, self.defaults.start_tor())
    }

    /// Return whether we should show network settings at startup.
    pub fn prompt_at_startup(&self) -> bool {
        self.get_bool(PREF_PROMPT_AT_STARTUP, self.defaults.prompt_at_startup())
    }

    /// Record whether we should show network settings at startup.
    pub fn set_prompt_at_startup(&self, value: bool) {
        self.store.set(
            PREF_PROMPT_AT_STARTUP,
            Some(PrefValue::Bool(value)),
            PrefScope::Persistent,
        );
    }

    /// Return whether we should only configure an existing Tor process.
    pub fn only_configure_tor(&self) -> bool {
        self.get_bool(
            PREF_ONLY_CONFIGURE_TOR,
            self.defaults.only_configure_tor(),
        )
    }

    /// Return the type of default bridges to use, if any.
    ///
    /// An empty stored value means "none".
    pub fn default_bridge_type(&self) -> Option<String> {
        match self.store.get(PREF_DEFAULT_BRIDGE_TYPE) {
            Some(PrefValue::String(s)) if s.is_empty() => None,
            Some(PrefValue::String(s)) => Some(s),
            Some(_) | None => self.defaults.default_bridge_type().map(str::to_owned),
        }
    }

    /// Record which type of default bridges to use.
    ///
    /// `None` is stored as an empty string, so that it overrides the
    /// configured default.
    pub fn set_default_bridge_type(&self, value: Option<&str>) {
        self.store.set(
            PREF_DEFAULT_BRIDGE_TYPE,
            Some(PrefValue::String(value.unwrap_or_default().to_owned())),
            PrefScope::Persistent,
        );
    }

    /// Return the default bridges of the currently selected type.
    ///
    /// Returns `None` if no type is selected, and an empty list if there are
    /// no bridges of that type.
    pub fn default_bridges(&self) -> Option<Vec<String>> {
        let bridge_type = self.default_bridge_type()?;
        Some(self.default_bridges_of_type(&bridge_type))
    }

    /// Return the default bridges of type `bridge_type`.
    pub fn default_bridges_of_type(&self, bridge_type: &str) -> Vec<String> {
        self.defaults
            .default_bridges()
            .get(bridge_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Return every bridge type that has default bridges.
    pub fn default_bridge_types(&self) -> Vec<String> {
        self.defaults
            .default_bridges()
            .iter()
            .filter(|(_, bridges)| !bridges.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;
    use crate::host::InMemoryPreferences;

    fn prefs() -> (Arc<InMemoryPreferences>, Preferences) {
        let store = Arc::new(InMemoryPreferences::new());
        let mut defaults = PreferenceDefaults::builder();
        defaults.default_bridge_type("obfs4".into()).default_bridges(
            [
                ("obfs4".to_string(), vec!["obfs4 1.2.3.4:443 AAAA".to_string()]),
                ("meek".to_string(), vec![]),
            ]
            .into(),
        );
        let prefs = Preferences::new(store.clone(), defaults.build().unwrap());
        (store, prefs)
    }

    #[test]
    fn fallbacks() {
        let (store, prefs) = prefs();
        assert!(prefs.start_tor());
        assert!(prefs.prompt_at_startup());
        assert!(!prefs.only_configure_tor());

        prefs.set_prompt_at_startup(false);
        assert!(!prefs.prompt_at_startup());
        assert_eq!(store.scope(PREF_PROMPT_AT_STARTUP), Some(PrefScope::Persistent));

        store.set(
            PREF_START_TOR,
            Some(PrefValue::String("yes".into())),
            PrefScope::Session,
        );
        assert!(prefs.start_tor());
    }

    #[test]
    fn bridges() {
        let (_store, prefs) = prefs();
        assert_eq!(prefs.default_bridge_type().as_deref(), Some("obfs4"));
        assert_eq!(prefs.default_bridges().unwrap().len(), 1);
        assert_eq!(prefs.default_bridge_types(), vec!["obfs4".to_string()]);

        prefs.set_default_bridge_type(Some("meek"));
        assert_eq!(prefs.default_bridges(), Some(vec![]));

        prefs.set_default_bridge_type(None);
        assert_eq!(prefs.default_bridge_type(), None);
        assert_eq!(prefs.default_bridges(), None);
    }
}
