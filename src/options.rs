//! Boot-time kernel options.
//!
//! Options are a whitespace-separated list of `key` or `key=value` entries
//! parsed once during early boot. Consumers look options up by dotted name
//! (e.g. `sched.time_slice`) and fall back to a built-in default when the
//! option is unset, invalid, or the option string was never provided at all.

use alloc::collections::btree_map::BTreeMap;
use alloc::collections::btree_set::BTreeSet;

use crate::log;
use crate::sync::UninterruptibleSpinlock;
use crate::util::OneShotManualInit;

static OPTIONS: OneShotManualInit<KernelOptions> = OneShotManualInit::uninit();

pub struct KernelOptions {
    options: BTreeMap<&'static str, Option<&'static str>>,
    warned_invalid: UninterruptibleSpinlock<BTreeSet<&'static str>>,
}

impl KernelOptions {
    pub fn parse(s: &'static str) -> Self {
        let mut options = BTreeMap::new();

        for entry in s.split_whitespace() {
            match entry.split_once('=') {
                Some((key, val)) => {
                    options.insert(key, Some(val));
                },
                None => {
                    options.insert(entry, None);
                },
            }
        }

        KernelOptions {
            options,
            warned_invalid: UninterruptibleSpinlock::new(BTreeSet::new()),
        }
    }

    pub fn try_get<T: KernelOptionParseable>(&self, key: &str) -> Option<Option<Result<T, InvalidOptionValue>>> {
        self.options.get(key).map(|val| val.map(T::try_parse_kopt))
    }

    pub fn warn_invalid(key: &str) {
        log!(Warning, "options", "Invalid value given for option '{}'", key);
    }

    fn warn_invalid_once(&self, key: &str) {
        let Some((&key, _)) = self.options.get_key_value(key) else {
            return;
        };

        if self.warned_invalid.lock().insert(key) {
            Self::warn_invalid(key);
        }
    }

    pub fn get<T: KernelOptionParseable>(&self, key: &str) -> Option<T> {
        match self.try_get(key) {
            Some(Some(Ok(val))) => Some(val),
            Some(_) => {
                self.warn_invalid_once(key);
                None
            },
            None => None,
        }
    }

    /// Gets a boolean option, where a bare `key` with no value means `true`.
    pub fn get_flag(&self, key: &str) -> Option<bool> {
        match self.try_get(key) {
            Some(Some(Ok(val))) => Some(val),
            Some(None) => Some(true),
            Some(Some(Err(_))) => {
                self.warn_invalid_once(key);
                None
            },
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Option<&'static str>)> + '_ {
        self.options.iter().map(|(&k, &v)| (k, v))
    }
}

pub struct InvalidOptionValue;

pub trait KernelOptionParseable
where
    Self: Sized,
{
    fn try_parse_kopt(s: &'static str) -> Result<Self, InvalidOptionValue>;
}

impl KernelOptionParseable for &'static str {
    fn try_parse_kopt(s: &'static str) -> Result<Self, InvalidOptionValue> {
        Ok(s)
    }
}

impl KernelOptionParseable for u32 {
    fn try_parse_kopt(s: &'static str) -> Result<Self, InvalidOptionValue> {
        s.parse().map_err(|_| InvalidOptionValue)
    }
}

impl KernelOptionParseable for u64 {
    fn try_parse_kopt(s: &'static str) -> Result<Self, InvalidOptionValue> {
        s.parse().map_err(|_| InvalidOptionValue)
    }
}

impl KernelOptionParseable for usize {
    fn try_parse_kopt(s: &'static str) -> Result<Self, InvalidOptionValue> {
        s.parse().map_err(|_| InvalidOptionValue)
    }
}

impl KernelOptionParseable for bool {
    fn try_parse_kopt(s: &'static str) -> Result<Self, InvalidOptionValue> {
        match s {
            "0" => Ok(false),
            "false" => Ok(false),
            "1" => Ok(true),
            "true" => Ok(true),
            "no" => Ok(false),
            "yes" => Ok(true),
            _ => Err(InvalidOptionValue),
        }
    }
}

/// Parses the boot option string. May only be called once.
pub fn init(s: &'static str) {
    OPTIONS.set(KernelOptions::parse(s));
}

pub fn get() -> Option<&'static KernelOptions> {
    OPTIONS.try_get()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_keys_and_values() {
        let opts = KernelOptions::parse("  debugger sched.time_slice=8  log.level=debug ");

        assert_eq!(Some(true), opts.get_flag("debugger"));
        assert_eq!(Some(8), opts.get::<u32>("sched.time_slice"));
        assert_eq!(Some("debug"), opts.get::<&str>("log.level"));
        assert_eq!(None, opts.get::<u32>("sched.nonexistent"));
    }

    #[test]
    fn test_parse_empty() {
        let opts = KernelOptions::parse("");

        assert_eq!(0, opts.iter().count());
        assert_eq!(None, opts.get_flag("anything"));
    }

    #[test]
    fn test_invalid_value_yields_none() {
        let opts = KernelOptions::parse("sched.time_slice=soon x=maybe");

        assert_eq!(None, opts.get::<u32>("sched.time_slice"));
        assert_eq!(None, opts.get_flag("x"));
    }

    #[test]
    fn test_bool_spellings() {
        let opts = KernelOptions::parse("a=yes b=0 c=true d=no");

        assert_eq!(Some(true), opts.get_flag("a"));
        assert_eq!(Some(false), opts.get_flag("b"));
        assert_eq!(Some(true), opts.get_flag("c"));
        assert_eq!(Some(false), opts.get_flag("d"));
    }
}
