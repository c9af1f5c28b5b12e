//! WebSocket extensions (RFC 6455 Section 9).
//!
//! Extensions form a closed set. An [`ExtensionFactory`] takes part in the
//! handshake and, once parameters are agreed, produces an [`Extension`] that
//! transforms frames. The negotiated extensions of a connection live in an
//! [`ExtensionPipeline`]: outgoing frames pass through it in negotiated
//! order, incoming frames in reverse order.
//!
//! ```rust
//! use wsconn::extensions::{ExtensionOffer, ExtensionParam};
//!
//! let offers = ExtensionOffer::parse_header(
//!     "permessage-deflate; client_max_window_bits, x-webkit-deflate-frame",
//! )
//! .unwrap();
//! assert_eq!(offers.len(), 2);
//! assert_eq!(
//!     offers[0].params,
//!     vec![ExtensionParam::flag("client_max_window_bits")]
//! );
//! ```

#[cfg(feature = "compression")]
pub mod deflate;

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Frame;

/// A single extension parameter, `name` or `name=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Parameter name, e.g. `client_max_window_bits`.
    pub name: String,
    /// Parameter value. `None` for flags.
    pub value: Option<String>,
}

impl ExtensionParam {
    /// Parameter with a value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Parameter without a value.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Parse `name` or `name=value`; quoted values are unquoted.
    pub fn parse(s: &str) -> Self {
        match s.trim().split_once('=') {
            Some((name, value)) => Self::new(name.trim(), value.trim().trim_matches('"')),
            None => Self::flag(s.trim()),
        }
    }
}

impl fmt::Display for ExtensionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// One element of a `Sec-WebSocket-Extensions` header: a name followed by
/// semicolon-separated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension name, e.g. `permessage-deflate`.
    pub name: String,
    /// Parameters in header order.
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// Offer without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Offer with parameters.
    pub fn with_params(name: impl Into<String>, params: Vec<ExtensionParam>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Parse `name; param; param=value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extension`] if the name or a parameter name is empty.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let name = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            return Err(Error::Extension("empty extension name".into()));
        }
        let params = parts
            .map(ExtensionParam::parse)
            .map(|p| {
                if p.name.is_empty() {
                    Err(Error::Extension(format!("empty parameter in {name}")))
                } else {
                    Ok(p)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_params(name, params))
    }

    /// Parse a comma-separated header value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extension`] if any element is malformed.
    pub fn parse_header(header: &str) -> Result<Vec<Self>> {
        header
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Parse every occurrence of the header, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extension`] if any element is malformed.
    pub fn parse_headers<'a>(values: impl IntoIterator<Item = &'a str>) -> Result<Vec<Self>> {
        let mut offers = Vec::new();
        for value in values {
            offers.extend(Self::parse_header(value)?);
        }
        Ok(offers)
    }

    /// Look up a parameter by name.
    #[must_use]
    pub fn get_param(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Whether a parameter is present.
    #[must_use]
    pub fn has_param(&self, name: &str) -> bool {
        self.get_param(name).is_some()
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for param in &self.params {
            write!(f, "; {param}")?;
        }
        Ok(())
    }
}

/// Join offers into a header value.
#[must_use]
pub fn format_header(offers: &[ExtensionOffer]) -> String {
    offers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reserved header bits claimed by an extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RsvBits {
    /// RSV1, used by permessage-deflate.
    pub rsv1: bool,
    /// RSV2.
    pub rsv2: bool,
    /// RSV3.
    pub rsv3: bool,
}

impl RsvBits {
    /// No bits.
    pub const NONE: Self = Self {
        rsv1: false,
        rsv2: false,
        rsv3: false,
    };

    /// RSV1 only.
    pub const RSV1: Self = Self {
        rsv1: true,
        rsv2: false,
        rsv3: false,
    };

    /// Whether any bit is set.
    #[must_use]
    pub const fn any(self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    /// Bits set in `self` but not in `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self {
            rsv1: self.rsv1 && !other.rsv1,
            rsv2: self.rsv2 && !other.rsv2,
            rsv3: self.rsv3 && !other.rsv3,
        }
    }

    /// Bits set in either.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            rsv1: self.rsv1 || other.rsv1,
            rsv2: self.rsv2 || other.rsv2,
            rsv3: self.rsv3 || other.rsv3,
        }
    }

    /// Whether both claim a common bit.
    #[must_use]
    pub const fn conflicts_with(self, other: Self) -> bool {
        (self.rsv1 && other.rsv1) || (self.rsv2 && other.rsv2) || (self.rsv3 && other.rsv3)
    }
}

/// A bidirectional frame transform.
///
/// `encode` runs on outgoing frames and `decode` on incoming ones. A decode
/// step must clear the reserved bits it consumed.
pub trait FrameTransform {
    /// Reserved bits this transform may set on the wire.
    fn rsv_bits(&self) -> RsvBits;

    /// Transform an outgoing frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extension`] if the transform fails.
    fn encode(&mut self, frame: Frame) -> Result<Frame>;

    /// Transform an incoming frame. `max_size` bounds the decoded payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extension`] or [`Error::PayloadTooBig`].
    fn decode(&mut self, frame: Frame, max_size: Option<usize>) -> Result<Frame>;
}

fn encode_chain<T: FrameTransform>(chain: &mut [T], frame: Frame) -> Result<Frame> {
    chain.iter_mut().try_fold(frame, |frame, ext| ext.encode(frame))
}

fn decode_chain<T: FrameTransform>(
    chain: &mut [T],
    frame: Frame,
    max_size: Option<usize>,
) -> Result<Frame> {
    chain
        .iter_mut()
        .rev()
        .try_fold(frame, |frame, ext| ext.decode(frame, max_size))
}

fn rsv_union<T: FrameTransform>(chain: &[T]) -> RsvBits {
    chain
        .iter()
        .fold(RsvBits::NONE, |bits, ext| bits.union(ext.rsv_bits()))
}

/// A negotiated extension instance.
#[derive(Debug)]
#[non_exhaustive]
pub enum Extension {
    /// permessage-deflate (RFC 7692).
    #[cfg(feature = "compression")]
    PerMessageDeflate(deflate::PerMessageDeflate),
}

impl Extension {
    /// Registered extension name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "compression")]
            Self::PerMessageDeflate(_) => deflate::EXTENSION_NAME,
        }
    }
}

impl FrameTransform for Extension {
    fn rsv_bits(&self) -> RsvBits {
        match *self {
            #[cfg(feature = "compression")]
            Self::PerMessageDeflate(ref ext) => ext.rsv_bits(),
        }
    }

    fn encode(&mut self, frame: Frame) -> Result<Frame> {
        match *self {
            #[cfg(feature = "compression")]
            Self::PerMessageDeflate(ref mut ext) => ext.encode(frame),
        }
    }

    fn decode(&mut self, frame: Frame, max_size: Option<usize>) -> Result<Frame> {
        match *self {
            #[cfg(feature = "compression")]
            Self::PerMessageDeflate(ref mut ext) => ext.decode(frame, max_size),
        }
    }
}

/// Local capability to negotiate an extension.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExtensionFactory {
    /// permessage-deflate with the given local preferences.
    #[cfg(feature = "compression")]
    PerMessageDeflate(deflate::DeflateConfig),
}

impl ExtensionFactory {
    /// Registered extension name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "compression")]
            Self::PerMessageDeflate(_) => deflate::EXTENSION_NAME,
        }
    }

    /// Client side: the offer sent in the request.
    #[must_use]
    pub fn offer(&self) -> ExtensionOffer {
        match *self {
            #[cfg(feature = "compression")]
            Self::PerMessageDeflate(ref config) => config.client_offer(),
        }
    }

    /// Client side: build the extension from the server's response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extension`] if the response parameters are not
    /// acceptable for the offer that was sent.
    pub fn accept_response(&self, response: &ExtensionOffer) -> Result<Extension> {
        match *self {
            #[cfg(feature = "compression")]
            Self::PerMessageDeflate(ref config) => config
                .accept_response(&response.params)
                .map(Extension::PerMessageDeflate),
        }
    }

    /// Server side: answer a client offer, or `None` to decline it.
    #[must_use]
    pub fn accept_offer(&self, offer: &ExtensionOffer) -> Option<(ExtensionOffer, Extension)> {
        match *self {
            #[cfg(feature = "compression")]
            Self::PerMessageDeflate(ref config) => config
                .accept_offer(&offer.params)
                .map(|(response, ext)| (response, Extension::PerMessageDeflate(ext))),
        }
    }
}

/// `Sec-WebSocket-Extensions` value offered by a client, if any.
#[must_use]
pub fn offer_header(factories: &[ExtensionFactory]) -> Option<String> {
    if factories.is_empty() {
        return None;
    }
    let offers: Vec<_> = factories.iter().map(ExtensionFactory::offer).collect();
    Some(format_header(&offers))
}

/// Server side negotiation.
///
/// Client offers are considered in the order sent. Each is tried against the
/// local factories in preference order and the first factory that accepts
/// wins. Offers nobody accepts are dropped, as are offers for an extension
/// already accepted or whose reserved bits clash with an accepted one.
/// Returns the response offers and the resulting pipeline.
#[must_use]
pub fn negotiate_server(
    factories: &[ExtensionFactory],
    offers: &[ExtensionOffer],
) -> (Vec<ExtensionOffer>, ExtensionPipeline) {
    let mut responses = Vec::new();
    let mut accepted: Vec<Extension> = Vec::new();

    for offer in offers {
        if accepted.iter().any(|ext| ext.name() == offer.name) {
            continue;
        }
        let claimed = rsv_union(&accepted);
        let matched = factories
            .iter()
            .filter(|factory| factory.name() == offer.name)
            .find_map(|factory| factory.accept_offer(offer))
            .filter(|(_, ext)| !ext.rsv_bits().conflicts_with(claimed));

        match matched {
            Some((response, ext)) => {
                debug!(extension = %response, "accepted extension");
                responses.push(response);
                accepted.push(ext);
            }
            None => debug!(extension = %offer, "declined extension"),
        }
    }

    (responses, ExtensionPipeline::new(accepted))
}

/// Client side negotiation: every extension the server accepted must match
/// a local factory, at most once.
///
/// # Errors
///
/// Returns [`Error::InvalidHandshake`] for an unknown or repeated extension
/// and [`Error::Extension`] for unacceptable parameters.
pub fn negotiate_client(
    factories: &[ExtensionFactory],
    responses: &[ExtensionOffer],
) -> Result<ExtensionPipeline> {
    let mut accepted: Vec<Extension> = Vec::new();

    for response in responses {
        if accepted.iter().any(|ext| ext.name() == response.name) {
            return Err(Error::handshake(format!(
                "extension accepted twice: {}",
                response.name
            )));
        }
        let factory = factories
            .iter()
            .find(|factory| factory.name() == response.name)
            .ok_or_else(|| Error::handshake(format!("unsupported extension: {response}")))?;
        accepted.push(factory.accept_response(response)?);
    }

    Ok(ExtensionPipeline::new(accepted))
}

/// Negotiated extensions of one connection, in negotiated order.
#[derive(Debug, Default)]
pub struct ExtensionPipeline {
    extensions: Vec<Extension>,
}

impl ExtensionPipeline {
    /// Pipeline over the given extensions.
    #[must_use]
    pub fn new(extensions: Vec<Extension>) -> Self {
        Self { extensions }
    }

    /// Whether no extension was negotiated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Number of extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Extension names in negotiated order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.extensions.iter().map(Extension::name).collect()
    }

    /// Reserved bits claimed by any extension.
    #[must_use]
    pub fn rsv_bits(&self) -> RsvBits {
        rsv_union(&self.extensions)
    }

    /// Run an outgoing frame through every extension, first to last.
    ///
    /// # Errors
    ///
    /// Propagates the first extension failure.
    pub fn encode(&mut self, frame: Frame) -> Result<Frame> {
        encode_chain(&mut self.extensions, frame)
    }

    /// Run an incoming frame through every extension, last to first.
    ///
    /// # Errors
    ///
    /// Propagates the first extension failure.
    pub fn decode(&mut self, frame: Frame, max_size: Option<usize>) -> Result<Frame> {
        decode_chain(&mut self.extensions, frame, max_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;

    /// Appends its tag to data payloads on encode and strips it on decode.
    struct Tag {
        tag: u8,
        bits: RsvBits,
        log: Vec<&'static str>,
    }

    impl Tag {
        fn new(tag: u8) -> Self {
            Self {
                tag,
                bits: RsvBits::NONE,
                log: Vec::new(),
            }
        }
    }

    impl FrameTransform for Tag {
        fn rsv_bits(&self) -> RsvBits {
            self.bits
        }

        fn encode(&mut self, mut frame: Frame) -> Result<Frame> {
            self.log.push("encode");
            frame.payload.push(self.tag);
            Ok(frame)
        }

        fn decode(&mut self, mut frame: Frame, _max_size: Option<usize>) -> Result<Frame> {
            self.log.push("decode");
            match frame.payload.pop() {
                Some(t) if t == self.tag => Ok(frame),
                _ => Err(Error::Extension(format!("missing tag {}", self.tag))),
            }
        }
    }

    #[test]
    fn test_param_parse() {
        assert_eq!(
            ExtensionParam::parse(" server_max_window_bits = \"10\" "),
            ExtensionParam::new("server_max_window_bits", "10")
        );
        assert_eq!(
            ExtensionParam::parse("client_no_context_takeover"),
            ExtensionParam::flag("client_no_context_takeover")
        );
    }

    #[test]
    fn test_offer_parse_and_display() {
        let offer =
            ExtensionOffer::parse("permessage-deflate; client_max_window_bits=10; server_no_context_takeover")
                .unwrap();
        assert_eq!(offer.name, "permessage-deflate");
        assert_eq!(
            offer.get_param("client_max_window_bits").and_then(|p| p.value.as_deref()),
            Some("10")
        );
        assert!(offer.has_param("server_no_context_takeover"));
        assert_eq!(
            offer.to_string(),
            "permessage-deflate; client_max_window_bits=10; server_no_context_takeover"
        );
    }

    #[test]
    fn test_offer_parse_errors() {
        assert!(ExtensionOffer::parse("").is_err());
        assert!(ExtensionOffer::parse("; x=1").is_err());
        assert!(ExtensionOffer::parse("foo;;").is_err());
    }

    #[test]
    fn test_parse_headers_across_fields() {
        let offers = ExtensionOffer::parse_headers(["a, b; x", "c"]).unwrap();
        let names: Vec<_> = offers.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(ExtensionOffer::parse_header("  ").unwrap().is_empty());
    }

    #[test]
    fn test_rsv_bits_ops() {
        let all = RsvBits {
            rsv1: true,
            rsv2: true,
            rsv3: true,
        };
        assert!(!RsvBits::NONE.any());
        assert!(all.without(RsvBits::RSV1).rsv2);
        assert!(!all.without(RsvBits::RSV1).rsv1);
        assert_eq!(RsvBits::NONE.union(RsvBits::RSV1), RsvBits::RSV1);
        assert!(RsvBits::RSV1.conflicts_with(all));
        assert!(!RsvBits::RSV1.conflicts_with(RsvBits::NONE));
    }

    #[test]
    fn test_chain_order_is_symmetric() {
        let mut chain = vec![Tag::new(1), Tag::new(2)];
        let frame = encode_chain(&mut chain, Frame::binary(vec![0])).unwrap();
        assert_eq!(frame.payload, vec![0, 1, 2]);

        // The peer undoes the last transform first.
        let frame = decode_chain(&mut chain, frame, None).unwrap();
        assert_eq!(frame.payload, vec![0]);
        assert_eq!(chain[0].log, ["encode", "decode"]);
    }

    #[test]
    fn test_chain_decode_in_wrong_order_fails() {
        let mut encoder = vec![Tag::new(1), Tag::new(2)];
        let mut decoder = vec![Tag::new(2), Tag::new(1)];
        let frame = encode_chain(&mut encoder, Frame::binary(vec![])).unwrap();
        assert!(decode_chain(&mut decoder, frame, None).is_err());
    }

    #[test]
    fn test_rsv_union() {
        let mut a = Tag::new(1);
        a.bits = RsvBits::RSV1;
        let mut b = Tag::new(2);
        b.bits = RsvBits {
            rsv1: false,
            rsv2: false,
            rsv3: true,
        };
        let bits = rsv_union(&[a, b]);
        assert!(bits.rsv1 && bits.rsv3 && !bits.rsv2);
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let mut pipeline = ExtensionPipeline::default();
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.rsv_bits(), RsvBits::NONE);
        let frame = Frame::new(false, OpCode::Text, b"abc".to_vec());
        assert_eq!(pipeline.encode(frame.clone()).unwrap(), frame);
        assert_eq!(pipeline.decode(frame.clone(), None).unwrap(), frame);
    }

    #[test]
    fn test_no_factories_no_offer() {
        assert_eq!(offer_header(&[]), None);
        let (responses, pipeline) =
            negotiate_server(&[], &[ExtensionOffer::new("permessage-deflate")]);
        assert!(responses.is_empty());
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_client_rejects_unknown_extension() {
        let err = negotiate_client(&[], &[ExtensionOffer::new("x-unknown")]).unwrap_err();
        assert!(matches!(err, Error::InvalidHandshake(msg) if msg.contains("x-unknown")));
    }

    #[cfg(feature = "compression")]
    mod deflate_negotiation {
        use super::*;
        use crate::extensions::deflate::DeflateConfig;

        fn deflate() -> ExtensionFactory {
            ExtensionFactory::PerMessageDeflate(DeflateConfig::default())
        }

        #[test]
        fn test_offer_header() {
            assert_eq!(
                offer_header(&[deflate()]).as_deref(),
                Some("permessage-deflate; client_max_window_bits")
            );
        }

        #[test]
        fn test_server_accepts_first_matching_offer() {
            let offers = ExtensionOffer::parse_header(
                "x-unknown, permessage-deflate; server_max_window_bits=7, permessage-deflate",
            )
            .unwrap();
            let (responses, pipeline) = negotiate_server(&[deflate()], &offers);
            // The unknown offer and the invalid window size are dropped.
            assert_eq!(responses, vec![ExtensionOffer::new("permessage-deflate")]);
            assert_eq!(pipeline.names(), ["permessage-deflate"]);
            assert_eq!(pipeline.rsv_bits(), RsvBits::RSV1);
        }

        #[test]
        fn test_server_accepts_extension_once() {
            let offers =
                ExtensionOffer::parse_header("permessage-deflate, permessage-deflate").unwrap();
            let (responses, pipeline) = negotiate_server(&[deflate()], &offers);
            assert_eq!(responses.len(), 1);
            assert_eq!(pipeline.len(), 1);
        }

        #[test]
        fn test_client_accepts_known_extension() {
            let pipeline =
                negotiate_client(&[deflate()], &[ExtensionOffer::new("permessage-deflate")])
                    .unwrap();
            assert_eq!(pipeline.names(), ["permessage-deflate"]);
        }

        #[test]
        fn test_client_rejects_repeated_extension() {
            let responses = vec![
                ExtensionOffer::new("permessage-deflate"),
                ExtensionOffer::new("permessage-deflate"),
            ];
            assert!(matches!(
                negotiate_client(&[deflate()], &responses),
                Err(Error::InvalidHandshake(_))
            ));
        }
    }
}
