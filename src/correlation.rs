use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

/// Links a request to its eventual response. Simple proxies correlate structurally by stream
///  id, bridges between asynchronous protocols derive a digest from the request's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Stream(u64),
    Digest([u8; 32]),
}

impl Debug for CorrelationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrelationKey::Stream(id) => write!(f, "Stream({})", id),
            CorrelationKey::Digest(digest) => {
                write!(f, "Digest(")?;
                for b in &digest[..8] {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "..)")
            }
        }
    }
}

/// Builds a content-derived [`CorrelationKey`].
///
/// Header entries are hashed sorted by name and then value (byte-lexicographically), so the
///  order in which they are added does not matter. Payload bytes are hashed in the order they
///  are added, and the token is hashed after the headers.
#[derive(Clone, Default)]
pub struct CorrelationDigest {
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    token: Option<Vec<u8>>,
    payload: Option<Sha256>,
}

impl CorrelationDigest {
    pub fn new() -> CorrelationDigest {
        Default::default()
    }

    pub fn header(&mut self, name: &[u8], value: &[u8]) -> &mut CorrelationDigest {
        self.headers.push((name.to_vec(), value.to_vec()));
        self
    }

    /// an idempotency key or a correlation id supplied by the client
    pub fn token(&mut self, token: &[u8]) -> &mut CorrelationDigest {
        self.token = Some(token.to_vec());
        self
    }

    pub fn payload(&mut self, bytes: &[u8]) -> &mut CorrelationDigest {
        self.payload.get_or_insert_with(Sha256::new)
            .update(bytes);
        self
    }

    pub fn finish(&self) -> CorrelationKey {
        let mut headers: Vec<&(Vec<u8>, Vec<u8>)> = self.headers.iter().collect();
        headers.sort();

        let mut hasher = Sha256::new();
        hasher.update(b"h");
        for (name, value) in headers {
            update_length_prefixed(&mut hasher, name);
            update_length_prefixed(&mut hasher, value);
        }
        if let Some(token) = &self.token {
            hasher.update(b"t");
            update_length_prefixed(&mut hasher, token);
        }
        if let Some(payload) = &self.payload {
            hasher.update(b"p");
            hasher.update(payload.clone().finalize());
        }
        CorrelationKey::Digest(hasher.finalize().into())
    }
}

fn update_length_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationHandle(u64);

#[derive(Debug)]
pub struct Completion<T> {
    pub handle: CorrelationHandle,
    pub request: T,
    pub response: Bytes,
}

struct PendingRequest<T> {
    handle: CorrelationHandle,
    request: T,
}

/// Requests that are in flight, waiting for their responses. An entry lives for exactly one
///  round trip: it is removed when the response is complete or when the request is abandoned.
pub struct Correlator<T> {
    pending: FxHashMap<CorrelationKey, PendingRequest<T>>,
    next_handle: u64,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Correlator {
            pending: FxHashMap::default(),
            next_handle: 1,
        }
    }
}

impl<T> Correlator<T> {
    pub fn new() -> Correlator<T> {
        Default::default()
    }

    /// Registers a request. A key that is already in flight is an error: retries of an
    ///  idempotent request must wait for the first attempt to complete or be abandoned.
    pub fn begin_request(&mut self, key: CorrelationKey, request: T) -> anyhow::Result<CorrelationHandle> {
        if self.pending.contains_key(&key) {
            bail!("correlation key {:?} is already in flight", key);
        }

        let handle = CorrelationHandle(self.next_handle);
        self.next_handle += 1;
        trace!("correlation {:?}: request {:?} started", key, handle);
        self.pending.insert(key, PendingRequest { handle, request });
        Ok(handle)
    }

    pub fn complete(&mut self, key: &CorrelationKey, response: Bytes) -> Option<Completion<T>> {
        let pending = self.pending.remove(key)?;
        debug!("correlation {:?}: request {:?} completed", key, pending.handle);
        Some(Completion {
            handle: pending.handle,
            request: pending.request,
            response,
        })
    }

    pub fn abandon(&mut self, key: &CorrelationKey) -> Option<T> {
        let pending = self.pending.remove(key)?;
        debug!("correlation {:?}: request {:?} abandoned", key, pending.handle);
        Some(pending.request)
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<&T> {
        self.pending.get(key)
            .map(|p| &p.request)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn digest(headers: &[(&str, &str)], token: Option<&str>) -> CorrelationKey {
        let mut digest = CorrelationDigest::new();
        for (name, value) in headers {
            digest.header(name.as_bytes(), value.as_bytes());
        }
        if let Some(token) = token {
            digest.token(token.as_bytes());
        }
        digest.finish()
    }

    #[rstest]
    #[case::same_order(vec![("a", "1"), ("b", "2"), ("c", "3")])]
    #[case::reversed(vec![("c", "3"), ("b", "2"), ("a", "1")])]
    #[case::shuffled(vec![("b", "2"), ("c", "3"), ("a", "1")])]
    fn test_digest_is_order_independent(#[case] headers: Vec<(&str, &str)>) {
        let reference = digest(&[("a", "1"), ("b", "2"), ("c", "3")], Some("key-1"));
        assert_eq!(digest(&headers, Some("key-1")), reference);
    }

    #[test]
    fn test_digest_duplicate_names() {
        assert_eq!(
            digest(&[("x", "2"), ("x", "1")], None),
            digest(&[("x", "1"), ("x", "2")], None),
        );
    }

    #[rstest]
    #[case::different_value(vec![("a", "1"), ("b", "3")], Some("key-1"))]
    #[case::different_token(vec![("a", "1"), ("b", "2")], Some("key-2"))]
    #[case::no_token(vec![("a", "1"), ("b", "2")], None)]
    #[case::missing_header(vec![("a", "1")], Some("key-1"))]
    #[case::shifted_boundary(vec![("a", "12"), ("b", "")], Some("key-1"))]
    fn test_digest_differs(#[case] headers: Vec<(&str, &str)>, #[case] token: Option<&str>) {
        let reference = digest(&[("a", "1"), ("b", "2")], Some("key-1"));
        assert_ne!(digest(&headers, token), reference);
    }

    #[test]
    fn test_digest_payload() {
        let mut a = CorrelationDigest::new();
        a.header(b"n", b"v").payload(b"hello ").payload(b"world");
        let mut b = CorrelationDigest::new();
        b.payload(b"hello world").header(b"n", b"v");
        let mut c = CorrelationDigest::new();
        c.header(b"n", b"v").payload(b"world hello ");

        assert_eq!(a.finish(), b.finish());
        assert_ne!(a.finish(), c.finish());
    }

    #[test]
    fn test_correlator_lifecycle() {
        let mut correlator = Correlator::new();
        let key = CorrelationKey::Stream(5);

        let handle = correlator.begin_request(key, "request").unwrap();
        assert_eq!(correlator.len(), 1);
        assert_eq!(correlator.get(&key), Some(&"request"));

        // a key can only be in flight once
        assert!(correlator.begin_request(key, "retry").is_err());

        let completion = correlator.complete(&key, Bytes::from_static(b"response")).unwrap();
        assert_eq!(completion.handle, handle);
        assert_eq!(completion.request, "request");
        assert_eq!(completion.response, Bytes::from_static(b"response"));
        assert!(correlator.is_empty());

        assert!(correlator.complete(&key, Bytes::new()).is_none());
        assert!(correlator.abandon(&key).is_none());

        // after completion, the key can be reused and gets a new handle
        let second = correlator.begin_request(key, "retry").unwrap();
        assert_ne!(second, handle);
        assert_eq!(correlator.abandon(&key), Some("retry"));
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_correlation_key_debug() {
        assert_eq!(format!("{:?}", CorrelationKey::Stream(3)), "Stream(3)");
        let digest = CorrelationKey::Digest([0xab; 32]);
        assert_eq!(format!("{:?}", digest), "Digest(abababababababab..)");
    }
}
