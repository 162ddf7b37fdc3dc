use serde::de::{self, Visitor};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde::Deserialize;
use std::fmt;

/// The capabilities of a backblaze authorization.
///
/// On the wire this is a list of strings such as `["listFiles", "writeFiles"]`;
/// capabilities this crate does not know about are ignored so new server-side
/// capabilities do not break deserialization.
#[derive(Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Capabilities {
    pub list_keys: bool,
    pub write_keys: bool,
    pub delete_keys: bool,
    pub list_buckets: bool,
    pub write_buckets: bool,
    pub delete_buckets: bool,
    pub list_files: bool,
    pub read_files: bool,
    pub share_files: bool,
    pub write_files: bool,
    pub delete_files: bool,
}

impl Capabilities {
    /// Create a new `Capabilities` with everything set to `false`.
    pub fn empty() -> Self {
        Capabilities::default()
    }
    /// Create a new `Capabilities` with everything set to `true`.
    pub fn all() -> Self {
        let mut cap = Capabilities::empty();
        for (_, field) in FIELDS {
            *field(&mut cap) = true;
        }
        cap
    }
    /// Iterate over the names of the capabilities that are set.
    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        let mut this = self.clone();
        FIELDS
            .iter()
            .filter(move |(_, field)| *field(&mut this))
            .map(|(name, _)| *name)
    }
    /// The number of capabilities that are set.
    pub fn len(&self) -> usize {
        self.iter().count()
    }
    /// Returns true if this authorization can do nothing at all.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

type Field = fn(&mut Capabilities) -> &mut bool;

static FIELDS: &[(&str, Field)] = &[
    ("listKeys", |c| &mut c.list_keys),
    ("writeKeys", |c| &mut c.write_keys),
    ("deleteKeys", |c| &mut c.delete_keys),
    ("listBuckets", |c| &mut c.list_buckets),
    ("writeBuckets", |c| &mut c.write_buckets),
    ("deleteBuckets", |c| &mut c.delete_buckets),
    ("listFiles", |c| &mut c.list_files),
    ("readFiles", |c| &mut c.read_files),
    ("shareFiles", |c| &mut c.share_files),
    ("writeFiles", |c| &mut c.write_files),
    ("deleteFiles", |c| &mut c.delete_files),
];

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for cap in self.iter() {
            seq.serialize_element(cap)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D>(deserializer: D) -> Result<Capabilities, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_seq(CapabilityVisitor)
    }
}

struct CapabilityVisitor;

impl<'de> Visitor<'de> for CapabilityVisitor {
    type Value = Capabilities;
    fn expecting(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "a list of capabilities")
    }
    fn visit_seq<A>(self, mut seq: A) -> Result<Capabilities, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut res = Capabilities::empty();
        while let Some(next) = seq.next_element::<String>()? {
            if let Some((_, field)) = FIELDS.iter().find(|(name, _)| *name == next) {
                *field(&mut res) = true;
            }
            // Unknown capabilities are ignored to stay forward compatible.
        }
        Ok(res)
    }
}
