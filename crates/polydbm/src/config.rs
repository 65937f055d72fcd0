//! Open-time configuration
//!
//! `OpenConfig` is the typed view of the params string handed to `open`.
//! Keys the bundled back-ends do not understand are carried in `extra`
//! and passed through unchanged.

use polydbm_common::Params;

/// Default stripe count of the hash back-end
pub const DEFAULT_NUM_BUCKETS: usize = 1024;

/// Default record capacity of the cache back-end
pub const DEFAULT_CAP_REC_NUM: usize = 1 << 20;

const KNOWN_KEYS: [&str; 11] = [
    "truncate",
    "no_create",
    "no_wait",
    "no_lock",
    "dbm",
    "file",
    "num_shards",
    "num_buckets",
    "key_comparator",
    "cap_rec_num",
    "cap_mem_size",
];

/// Typed open options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenConfig {
    /// Empty the file on open
    pub truncate: bool,

    /// Fail if the file does not exist
    pub no_create: bool,

    /// Fail instead of blocking on a held file lock
    pub no_wait: bool,

    /// Skip OS file locking
    pub no_lock: bool,

    /// Back-end class name overriding the path extension
    pub dbm: Option<String>,

    /// Raw file implementation name
    pub file: Option<String>,

    /// Number of shards; 0 means unsharded
    pub num_shards: usize,

    /// Hash stripe count (default: 1024)
    pub num_buckets: Option<usize>,

    /// Comparator name for ordered back-ends
    pub key_comparator: Option<String>,

    /// Record capacity of the cache back-end
    pub cap_rec_num: Option<usize>,

    /// Memory capacity of the cache back-end in bytes
    pub cap_mem_size: Option<usize>,

    /// Everything else, passed through to the back-end
    pub extra: Params,
}

fn positive(params: &Params, key: &str) -> Option<usize> {
    let value = params.get_i64(key, 0);
    if value > 0 {
        Some(value as usize)
    } else {
        None
    }
}

impl OpenConfig {
    /// Decode the recognized options from a params map
    pub fn from_params(params: &Params) -> Self {
        let extra = params
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(k))
            .collect();
        Self {
            truncate: params.get_bool("truncate", false),
            no_create: params.get_bool("no_create", false),
            no_wait: params.get_bool("no_wait", false),
            no_lock: params.get_bool("no_lock", false),
            dbm: params.get("dbm").filter(|v| !v.is_empty()).map(str::to_string),
            file: params.get("file").filter(|v| !v.is_empty()).map(str::to_string),
            num_shards: positive(params, "num_shards").unwrap_or(0),
            num_buckets: positive(params, "num_buckets"),
            key_comparator: params
                .get("key_comparator")
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            cap_rec_num: positive(params, "cap_rec_num"),
            cap_mem_size: positive(params, "cap_mem_size"),
            extra,
        }
    }

    /// Render back into a params map
    pub fn to_params(&self) -> Params {
        let mut params = self.extra.clone();
        let flags = [
            ("truncate", self.truncate),
            ("no_create", self.no_create),
            ("no_wait", self.no_wait),
            ("no_lock", self.no_lock),
        ];
        for (key, value) in flags {
            if value {
                params.insert(key, "true");
            }
        }
        if let Some(dbm) = &self.dbm {
            params.insert("dbm", dbm);
        }
        if let Some(file) = &self.file {
            params.insert("file", file);
        }
        if self.num_shards > 0 {
            params.insert("num_shards", self.num_shards);
        }
        if let Some(n) = self.num_buckets {
            params.insert("num_buckets", n);
        }
        if let Some(cmp) = &self.key_comparator {
            params.insert("key_comparator", cmp);
        }
        if let Some(n) = self.cap_rec_num {
            params.insert("cap_rec_num", n);
        }
        if let Some(n) = self.cap_mem_size {
            params.insert("cap_mem_size", n);
        }
        params
    }

    pub fn with_truncate(mut self, enabled: bool) -> Self {
        self.truncate = enabled;
        self
    }

    pub fn with_no_create(mut self, enabled: bool) -> Self {
        self.no_create = enabled;
        self
    }

    pub fn with_no_wait(mut self, enabled: bool) -> Self {
        self.no_wait = enabled;
        self
    }

    pub fn with_no_lock(mut self, enabled: bool) -> Self {
        self.no_lock = enabled;
        self
    }

    pub fn with_dbm(mut self, name: impl Into<String>) -> Self {
        self.dbm = Some(name.into());
        self
    }

    pub fn with_file(mut self, name: impl Into<String>) -> Self {
        self.file = Some(name.into());
        self
    }

    pub fn with_num_shards(mut self, num_shards: usize) -> Self {
        self.num_shards = num_shards;
        self
    }

    pub fn with_num_buckets(mut self, num_buckets: usize) -> Self {
        self.num_buckets = Some(num_buckets);
        self
    }

    pub fn with_key_comparator(mut self, name: impl Into<String>) -> Self {
        self.key_comparator = Some(name.into());
        self
    }

    pub fn with_cap_rec_num(mut self, cap: usize) -> Self {
        self.cap_rec_num = Some(cap);
        self
    }

    pub fn with_cap_mem_size(mut self, cap: usize) -> Self {
        self.cap_mem_size = Some(cap);
        self
    }
}

impl From<&Params> for OpenConfig {
    fn from(params: &Params) -> Self {
        OpenConfig::from_params(params)
    }
}

impl From<OpenConfig> for Params {
    fn from(config: OpenConfig) -> Self {
        config.to_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OpenConfig::from_params(&Params::new());
        assert!(!config.truncate);
        assert!(!config.no_lock);
        assert_eq!(config.num_shards, 0);
        assert!(config.dbm.is_none());
        assert!(config.extra.is_empty());
    }

    #[test]
    fn test_from_params() {
        let params = Params::parse(
            "truncate=true,num_buckets=5,num_shards=-3,dbm=tree,align_pow=4,key_comparator=",
        );
        let config = OpenConfig::from_params(&params);
        assert!(config.truncate);
        assert_eq!(config.num_buckets, Some(5));
        assert_eq!(config.num_shards, 0);
        assert_eq!(config.dbm.as_deref(), Some("tree"));
        assert!(config.key_comparator.is_none());
        assert_eq!(config.extra.get("align_pow"), Some("4"));
    }

    #[test]
    fn test_builder_renders_params() {
        let config = OpenConfig::default()
            .with_truncate(true)
            .with_num_shards(4)
            .with_dbm("StdTreeDBM")
            .with_key_comparator("DecimalKeyComparator");
        let params = config.to_params();
        assert_eq!(
            params.to_string(),
            "dbm=StdTreeDBM,key_comparator=DecimalKeyComparator,num_shards=4,truncate=true"
        );
        assert_eq!(OpenConfig::from_params(&params), config);
    }
}
