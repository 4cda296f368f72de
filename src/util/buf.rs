use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = try_get_len(buf)?;
    if buf.remaining() < len {
        bail!("string of {} bytes exceeds the remaining {} bytes", len, buf.remaining());
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}

pub fn try_get_len(buf: &mut impl Buf) -> anyhow::Result<usize> {
    buf.try_get_usize_varint()
        .map_err(|e| anyhow!("varint error: {:?}", e))
}

pub fn try_get_u16_be(buf: &mut impl Buf) -> anyhow::Result<u16> {
    if buf.remaining() < 2 {
        bail!("buffer underflow");
    }
    Ok(buf.get_u16())
}


#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::*;
    use super::*;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("localhost")]
    #[case::multibyte("größe")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(buf.len(), s.len() + 1);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::truncated(vec![5, b'a', b'b'])]
    #[case::invalid_utf8(vec![2, 0xc3, 0x28])]
    #[case::missing_len(vec![])]
    fn test_invalid_string(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(try_get_string(&mut b).is_err());
    }

    #[test]
    fn test_u16() {
        let mut b: &[u8] = &[1, 2, 3];
        assert_eq!(try_get_u16_be(&mut b).unwrap(), 0x0102);
        assert!(try_get_u16_be(&mut b).is_err());
    }
}
