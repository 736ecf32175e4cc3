use serde::Deserialize;

/// Dynamic value flowing through steps, lookups and promises.
pub type Value = serde_json::Value;

/// Exit status used when a run stops early so the host process can be
/// restarted (`EX_TEMPFAIL`).
pub const EX_TEMPFAIL: u8 = 75;

/// Runtime knobs of a [`Scheduler`](crate::Scheduler).
///
/// Deserializable, so it can be read from the same JSON documents the
/// specification comes from. Missing fields take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Exit status reported for [`RunStatus::Restart`](crate::RunStatus::Restart).
    pub restart_status: u8,
    /// When a pass makes no progress, reject the oldest outstanding resource
    /// lookup and retry instead of failing right away.
    pub break_deadlocks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            restart_status: EX_TEMPFAIL,
            break_deadlocks: true,
        }
    }
}

impl Config {
    pub fn with_restart_status(mut self, status: u8) -> Self {
        self.restart_status = status;
        self
    }

    pub fn with_deadlock_breaking(mut self, enabled: bool) -> Self {
        self.break_deadlocks = enabled;
        self
    }
}

/// The declarative description a run converges on.
///
/// Paths either name a top-level member (`"options"`) or, when they start
/// with `/`, are JSON pointers into nested data (`"/baz/2/blue"`). Lookups
/// never fail; absent paths are simply absent.
#[derive(Debug, Clone, Default)]
pub struct Specification(Value);

impl Specification {
    pub fn new(data: Value) -> Self {
        Self(data)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        if path.starts_with('/') {
            self.0.pointer(path)
        } else {
            self.0.get(path)
        }
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Value at `path`, or `default` when absent.
    pub fn value(&self, path: &str, default: Value) -> Value {
        self.get(path).cloned().unwrap_or(default)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn fixture() -> Specification {
        Specification::new(json!({
            "foo": 42,
            "empty": null,
            "baz": [1, 2, {"blue": "sky"}],
        }))
    }

    #[test]
    fn test_top_level_keys() {
        let spec = fixture();
        assert!(spec.has("foo"));
        assert!(spec.has("empty"));
        assert!(!spec.has("bar"));
        assert_eq!(spec.value("foo", json!(0)), json!(42));
        assert_eq!(spec.value("bar", json!("dflt")), json!("dflt"));
    }

    #[test]
    fn test_pointer_paths() {
        let spec = fixture();
        assert!(spec.has("/baz/2/blue"));
        assert!(!spec.has("/baz/15"));
        assert_eq!(spec.value("/baz/2/blue", Value::Null), json!("sky"));
        assert_eq!(spec.value("/baz/0", Value::Null), json!(1));
    }

    #[test]
    fn test_non_object_root() {
        let spec = Specification::new(json!([1, 2]));
        assert!(!spec.has("foo"));
        assert!(spec.has("/1"));
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_json::from_value(json!({"break_deadlocks": false})).unwrap();
        assert_eq!(config.restart_status, 75);
        assert!(!config.break_deadlocks);
        assert_eq!(Config::default().with_restart_status(3).restart_status, 3);
    }
}
