//! Node identity.
//!
//! An [`Identity`] names one incarnation of one node: the cluster `magic`,
//! the node `id` and the `epoch` the node was started at.  Two identities
//! are the same node when `(magic, id)` match; the epoch only tells
//! incarnations apart and is not part of `Eq`/`Hash`.

use {
    crate::error::{MembershipError, Result},
    serde::{Deserialize, Serialize},
    std::{
        cmp::Ordering,
        fmt,
        hash::{Hash, Hasher},
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Largest node id a cluster may use.
pub const MAX_ID: u16 = 2047;

/// Encoded size of an identity on the wire: `magic:i32 | id:u16 | epoch:i64`.
pub const IDENTITY_SIZE: usize = 14;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "RawIdentity")]
pub struct Identity {
    magic: i32,
    id: u16,
    epoch: i64,
}

#[derive(Deserialize)]
struct RawIdentity {
    magic: i32,
    id: u16,
    epoch: i64,
}

impl TryFrom<RawIdentity> for Identity {
    type Error = MembershipError;

    fn try_from(raw: RawIdentity) -> Result<Self> {
        Identity::new(raw.magic, raw.id, raw.epoch)
    }
}

impl Identity {
    /// Create an identity, rejecting ids above [`MAX_ID`].
    pub fn new(magic: i32, id: u16, epoch: i64) -> Result<Self> {
        if id > MAX_ID {
            return Err(MembershipError::InvalidNodeId(u32::from(id)));
        }
        Ok(Self { magic, id, epoch })
    }

    /// Create an identity whose epoch is the current wall-clock time in
    /// milliseconds.
    pub fn with_current_epoch(magic: i32, id: u16) -> Result<Self> {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        Self::new(magic, id, epoch)
    }

    pub fn magic(&self) -> i32 {
        self.magic
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    /// Same node and same incarnation.
    pub fn same_incarnation(&self, other: &Identity) -> bool {
        self == other && self.epoch == other.epoch
    }

    /// Compare incarnations of the same node.
    pub fn compare_epoch(&self, other: &Identity) -> Ordering {
        self.epoch.cmp(&other.epoch)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.epoch.to_be_bytes());
    }

    /// Decode the fixed-size wire form.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let Some(bytes) = bytes.get(..IDENTITY_SIZE) else {
            return Err(MembershipError::MalformedGossip(format!(
                "identity needs {IDENTITY_SIZE} bytes, got {}",
                bytes.len()
            )));
        };
        let mut magic = [0u8; 4];
        let mut id = [0u8; 2];
        let mut epoch = [0u8; 8];
        magic.copy_from_slice(&bytes[0..4]);
        id.copy_from_slice(&bytes[4..6]);
        epoch.copy_from_slice(&bytes[6..14]);
        Self::new(
            i32::from_be_bytes(magic),
            u16::from_be_bytes(id),
            i64::from_be_bytes(epoch),
        )
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.magic == other.magic && self.id == other.id
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.magic.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.magic, self.id, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches, std::collections::HashSet};

    #[test]
    fn test_epoch_not_part_of_equality() {
        let a = Identity::new(7, 3, 100).unwrap();
        let b = Identity::new(7, 3, 200).unwrap();
        assert_eq!(a, b);
        assert!(!a.same_incarnation(&b));
        assert_eq!(a.compare_epoch(&b), Ordering::Less);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_current_epoch_outranks_counters() {
        let fresh = Identity::with_current_epoch(7, 3).unwrap();
        // wall-clock millis, so any restart counter loses to it
        assert!(fresh.epoch() > 1_600_000_000_000);
        assert_eq!(fresh, Identity::new(7, 3, 1).unwrap());
        assert_eq!(
            fresh.compare_epoch(&Identity::new(7, 3, 1).unwrap()),
            Ordering::Greater
        );
        assert!(Identity::with_current_epoch(7, MAX_ID + 1).is_err());
    }

    #[test]
    fn test_magic_and_id_distinguish() {
        let a = Identity::new(7, 3, 100).unwrap();
        assert_ne!(a, Identity::new(8, 3, 100).unwrap());
        assert_ne!(a, Identity::new(7, 4, 100).unwrap());
    }

    #[test]
    fn test_id_bound() {
        assert!(Identity::new(1, MAX_ID, 0).is_ok());
        assert_matches!(
            Identity::new(1, MAX_ID + 1, 0),
            Err(MembershipError::InvalidNodeId(2048))
        );
    }

    #[test]
    fn test_wire_form() {
        let a = Identity::new(-5, 2000, 1_234_567_890_123).unwrap();
        let mut buf = Vec::new();
        a.write_to(&mut buf);
        assert_eq!(buf.len(), IDENTITY_SIZE);
        let b = Identity::read_from(&buf).unwrap();
        assert!(a.same_incarnation(&b));
        assert_eq!(b.magic(), -5);

        assert!(Identity::read_from(&buf[..10]).is_err());

        // id 4095 is out of range
        buf[4] = 0x0f;
        buf[5] = 0xff;
        assert_matches!(
            Identity::read_from(&buf),
            Err(MembershipError::InvalidNodeId(4095))
        );
    }
}
