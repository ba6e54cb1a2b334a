// Transaction branch identifier compared by content, never by reference.
use bytes::Bytes;
use std::fmt;

/// XA branch id: global transaction id plus branch qualifier.
///
/// Equality and hashing are structural over both byte fields, so two ids
/// decoded from separate protocol frames key the same registry entry.
///
/// ```
/// use mira_common::Xid;
///
/// let a = Xid::new(b"gtx-1".to_vec(), b"b1".to_vec());
/// let b = Xid::new(b"gtx-1".to_vec(), b"b1".to_vec());
/// assert_eq!(a, b);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Xid {
    global_id: Bytes,
    branch_qualifier: Bytes,
}

impl Xid {
    pub fn new(global_id: impl Into<Bytes>, branch_qualifier: impl Into<Bytes>) -> Self {
        Self {
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    pub fn global_id(&self) -> &[u8] {
        &self.global_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.global_id)?;
        f.write_str(":")?;
        write_hex(f, &self.branch_qualifier)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}
