//! Replies of the replication stage

use bytes::{BufMut, Bytes, BytesMut};
use osdflow_common::{FileId, ObjectNo};
use osdflow_stage::RpcReply;

const STATUS_EXISTS: u8 = 0;
const STATUS_PADDING: u8 = 1;
const STATUS_ACCEPTED: u8 = 2;

/// Content returned for a fetched object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectData {
    /// The object's data
    Exists(Bytes),
    /// The object is a hole or lies beyond the end of the file; the client
    /// pads with zeros
    Padding,
}

/// Answer to a client waiting for an object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectReply {
    pub file_id: FileId,
    pub object_no: ObjectNo,
    pub data: ObjectData,
    pub stripe_size: u64,
    /// Last object of the file, `None` if the file is empty
    pub last_object_no: Option<ObjectNo>,
}

/// Result delivered by the replication stage
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationReply {
    Object(ObjectReply),
    /// The request was accepted; nothing else to report
    Accepted,
}

impl ReplicationReply {
    /// The object reply, if this is one
    pub fn as_object(&self) -> Option<&ObjectReply> {
        match self {
            Self::Object(reply) => Some(reply),
            Self::Accepted => None,
        }
    }
}

/// Header layout: status (u8), object number, stripe size and last object
/// number (u64 each, `u64::MAX` for none), all big-endian. Object data
/// travels as bulk data.
impl From<ReplicationReply> for RpcReply {
    fn from(reply: ReplicationReply) -> Self {
        let mut header = BytesMut::with_capacity(25);
        match reply {
            ReplicationReply::Accepted => {
                header.put_u8(STATUS_ACCEPTED);
                Self {
                    message: header.freeze(),
                    data: None,
                }
            }
            ReplicationReply::Object(object) => {
                let (status, data) = match object.data {
                    ObjectData::Exists(data) => (STATUS_EXISTS, Some(data)),
                    ObjectData::Padding => (STATUS_PADDING, None),
                };
                header.put_u8(status);
                header.put_u64(object.object_no);
                header.put_u64(object.stripe_size);
                header.put_u64(object.last_object_no.unwrap_or(u64::MAX));
                Self {
                    message: header.freeze(),
                    data,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_reply_header() {
        let reply = ReplicationReply::Object(ObjectReply {
            file_id: FileId::from("1:1"),
            object_no: 3,
            data: ObjectData::Exists(Bytes::from_static(b"abc")),
            stripe_size: 4096,
            last_object_no: None,
        });
        let rpc = RpcReply::from(reply);
        assert_eq!(rpc.message.len(), 25);
        assert_eq!(rpc.message[0], STATUS_EXISTS);
        assert_eq!(&rpc.message[1..9], &3u64.to_be_bytes());
        assert_eq!(&rpc.message[17..25], &u64::MAX.to_be_bytes());
        assert_eq!(rpc.data, Some(Bytes::from_static(b"abc")));
    }

    #[test]
    fn test_padding_and_accepted_carry_no_data() {
        let padding = RpcReply::from(ReplicationReply::Object(ObjectReply {
            file_id: FileId::from("1:1"),
            object_no: 9,
            data: ObjectData::Padding,
            stripe_size: 4096,
            last_object_no: Some(4),
        }));
        assert_eq!(padding.message[0], STATUS_PADDING);
        assert!(padding.data.is_none());

        let accepted = RpcReply::from(ReplicationReply::Accepted);
        assert_eq!(&accepted.message[..], &[STATUS_ACCEPTED]);
        assert!(accepted.data.is_none());
    }
}
