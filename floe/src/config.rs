//! Runtime configuration of arrays.

use {
    crate::{AllocKind, MAX_BUCKETS},
    serde::Deserialize,
    std::{env, path::PathBuf},
};

/// Default number of buckets an in-memory array may use.
pub const DEFAULT_BUCKET_LIMIT: usize = 32;

/// Options for constructing an array.
///
/// The first bucket size is a const parameter of the array type;
/// everything else about where and how buckets are allocated lives here.
/// Options can be deserialized, with missing fields taking their defaults.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ArrayOptions
{
    /// Number of buckets the array may install.
    ///
    /// Clamped to [`MAX_BUCKETS`].
    pub bucket_limit: usize,

    /// Directory for file-backed buckets and archive files.
    pub directory: PathBuf,

    /// Name from which backing file names are derived.
    ///
    /// If absent, a name unique to this process is generated.
    /// File-backed buckets are only found again after a restart
    /// if the same name is used.
    pub name: Option<String>,

    /// How new buckets are allocated.
    pub kind: AllocKind,
}

impl Default for ArrayOptions
{
    fn default() -> Self
    {
        Self{
            bucket_limit: DEFAULT_BUCKET_LIMIT,
            directory: env::temp_dir(),
            name: None,
            kind: AllocKind::Default,
        }
    }
}

impl ArrayOptions
{
    /// Options with a custom bucket limit.
    pub fn with_bucket_limit(mut self, bucket_limit: usize) -> Self
    {
        self.bucket_limit = bucket_limit.min(MAX_BUCKETS);
        self
    }

    /// Options with a custom directory.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self
    {
        self.directory = directory.into();
        self
    }

    /// Options with a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self
    {
        self.name = Some(name.into());
        self
    }

    /// Options with a custom allocation kind.
    pub fn with_kind(mut self, kind: AllocKind) -> Self
    {
        self.kind = kind;
        self
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn missing_fields_take_defaults()
    {
        let options: ArrayOptions =
            serde_json::from_str(r#"{"name": "orders"}"#).unwrap();
        assert_eq!(options, ArrayOptions::default().with_name("orders"));
    }

    #[test]
    fn full_options_deserialize()
    {
        let json = r#"{
            "bucket_limit": 20,
            "directory": "/var/lib/floe",
            "name": "ticks",
            "kind": "memory_mapped"
        }"#;
        let options: ArrayOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.bucket_limit, 20);
        assert_eq!(options.directory, PathBuf::from("/var/lib/floe"));
        assert_eq!(options.name.as_deref(), Some("ticks"));
        assert_eq!(options.kind, AllocKind::MemoryMapped);
    }

    #[test]
    fn unknown_fields_are_rejected()
    {
        let result = serde_json::from_str::<ArrayOptions>(r#"{"buckets": 3}"#);
        assert!(result.is_err());
    }

    #[test]
    fn bucket_limit_is_clamped()
    {
        let options = ArrayOptions::default().with_bucket_limit(1000);
        assert_eq!(options.bucket_limit, MAX_BUCKETS);
    }
}
