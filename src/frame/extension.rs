use std::fmt::Debug;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Typed content of a frame's extension region. The frame codec treats extensions as opaque
///  octets, typed extensions start with their own type id.
pub trait Extension: Sized + Clone + Debug {
    const TYPE_ID: u32;

    fn ser_fields(&self, buf: &mut BytesMut);
    fn deser_fields(buf: &mut impl Buf) -> anyhow::Result<Self>;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(Self::TYPE_ID);
        self.ser_fields(buf);
    }

    /// `None` for an empty extension region
    fn decode(octets: &[u8]) -> anyhow::Result<Option<Self>> {
        if octets.is_empty() {
            return Ok(None);
        }

        let mut buf = octets;
        if buf.remaining() < 4 {
            bail!("extension of {} bytes is too short for a type id", octets.len());
        }
        let type_id = buf.get_u32();
        if type_id != Self::TYPE_ID {
            bail!("expected extension type {:#x}, got {:#x}", Self::TYPE_ID, type_id);
        }

        let result = Self::deser_fields(&mut buf)?;
        if buf.has_remaining() {
            bail!("{} trailing bytes after extension of type {:#x}", buf.remaining(), type_id);
        }
        Ok(Some(result))
    }
}

/// Extension octets that are passed through without interpretation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawExtension(pub Bytes);

impl Extension for RawExtension {
    const TYPE_ID: u32 = 0;

    fn ser_fields(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    fn deser_fields(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(RawExtension(buf.copy_to_bytes(buf.remaining())))
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.ser_fields(buf);
    }

    fn decode(octets: &[u8]) -> anyhow::Result<Option<Self>> {
        if octets.is_empty() {
            return Ok(None);
        }
        Ok(Some(RawExtension(Bytes::copy_from_slice(octets))))
    }
}

/// Declares the total length of a message on its first Data fragment, allowing reassembly to
///  complete without a FIN flag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageDataEx {
    pub length: u32,
}

impl Extension for MessageDataEx {
    const TYPE_ID: u32 = 0x6d64_0001;

    fn ser_fields(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length);
    }

    fn deser_fields(buf: &mut impl Buf) -> anyhow::Result<Self> {
        if buf.remaining() < 4 {
            bail!("message data extension is truncated");
        }
        Ok(MessageDataEx { length: buf.get_u32() })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_message_data_ex() {
        let mut buf = BytesMut::new();
        MessageDataEx { length: 300 }.encode(&mut buf);

        assert_eq!(buf.as_ref(), &[0x6d, 0x64, 0, 1, 0, 0, 1, 44]);
        assert_eq!(MessageDataEx::decode(&buf).unwrap(), Some(MessageDataEx { length: 300 }));
    }

    #[rstest]
    #[case::empty(vec![], Some(None))]
    #[case::too_short_for_type(vec![0x6d, 0x64], None)]
    #[case::wrong_type(vec![0, 0, 0, 1, 0, 0, 0, 5], None)]
    #[case::truncated(vec![0x6d, 0x64, 0, 1, 0, 0], None)]
    #[case::trailing(vec![0x6d, 0x64, 0, 1, 0, 0, 0, 5, 9], None)]
    #[case::regular(vec![0x6d, 0x64, 0, 1, 0, 0, 0, 5], Some(Some(MessageDataEx { length: 5 })))]
    fn test_message_data_ex_decode(#[case] octets: Vec<u8>, #[case] expected: Option<Option<MessageDataEx>>) {
        assert_eq!(MessageDataEx::decode(&octets).ok(), expected);
    }

    #[test]
    fn test_raw_extension() {
        assert_eq!(RawExtension::decode(b"").unwrap(), None);

        let raw = RawExtension::decode(b"abc").unwrap().unwrap();
        assert_eq!(raw, RawExtension(Bytes::from_static(b"abc")));

        let mut buf = BytesMut::new();
        raw.encode(&mut buf);
        assert_eq!(buf.as_ref(), b"abc");
    }
}
