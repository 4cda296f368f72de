use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::VarIntSupportMut;
use crate::binding::Binding;
use crate::config::RouteConfig;
use crate::correlation::{CorrelationDigest, CorrelationKey};
use crate::frame::{BeginFrame, Extension};
use crate::util::buf::{put_string, try_get_len, try_get_string, try_get_u16_be};

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Addressing of a proxied connection, as carried on the Begin frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBeginEx {
    pub source: String,
    pub destination: String,
    pub port: u16,
    /// additional name / value pairs, e.g. forwarded request headers
    pub info: Vec<(String, String)>,
}

impl ProxyBeginEx {
    pub fn info(&self, name: &str) -> Option<&str> {
        self.info.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl Extension for ProxyBeginEx {
    const TYPE_ID: u32 = 0x7078_0001;

    fn ser_fields(&self, buf: &mut BytesMut) {
        put_string(buf, &self.source);
        put_string(buf, &self.destination);
        buf.put_u16(self.port);
        buf.put_usize_varint(self.info.len());
        for (name, value) in &self.info {
            put_string(buf, name);
            put_string(buf, value);
        }
    }

    fn deser_fields(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let source = try_get_string(buf)?;
        let destination = try_get_string(buf)?;
        let port = try_get_u16_be(buf)?;

        let num_info = try_get_len(buf)?;
        // every entry needs at least two bytes
        if num_info > buf.remaining() / 2 {
            bail!("{} info entries do not fit into {} bytes", num_info, buf.remaining());
        }
        let mut info = Vec::with_capacity(num_info);
        for _ in 0..num_info {
            let name = try_get_string(buf)?;
            let value = try_get_string(buf)?;
            info.push((name, value));
        }

        Ok(ProxyBeginEx {
            source,
            destination,
            port,
            info,
        })
    }
}

/// Routes connections by destination and port.
///
/// Route conditions `port` and `destination` must match exactly if present. A connection whose
///  info carries an idempotency key is correlated by a digest over all of its info entries and
///  the key, so a retried request is recognized while its first attempt is still in flight.
pub struct ProxyBinding;

impl Binding for ProxyBinding {
    type BeginEx = ProxyBeginEx;

    fn matches(&self, route: &RouteConfig, begin_ex: Option<&ProxyBeginEx>) -> bool {
        route.when.iter()
            .all(|condition| match (condition.name.as_str(), begin_ex) {
                ("port", Some(ex)) => condition.value.parse::<u16>().ok() == Some(ex.port),
                ("destination", Some(ex)) => condition.value == ex.destination,
                ("port", None) | ("destination", None) => false,
                _ => true,
            })
    }

    fn correlate(&self, begin: &BeginFrame<'_>, begin_ex: Option<&ProxyBeginEx>) -> CorrelationKey {
        let Some(ex) = begin_ex else {
            return CorrelationKey::Stream(begin.stream_id());
        };
        let Some(token) = ex.info(IDEMPOTENCY_KEY) else {
            return CorrelationKey::Stream(begin.stream_id());
        };

        let mut digest = CorrelationDigest::new();
        for (name, value) in &ex.info {
            if name != IDEMPOTENCY_KEY {
                digest.header(name.as_bytes(), value.as_bytes());
            }
        }
        digest.header(b":destination", ex.destination.as_bytes());
        digest.token(token.as_bytes());
        digest.finish()
    }
}
