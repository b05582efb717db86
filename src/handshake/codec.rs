//! Handshake wire codec (CBOR).
//!
//! Every message is a definite-length array `[tag, payload...]`:
//!
//! | tag | message          | payload                                    |
//! |-----|------------------|--------------------------------------------|
//! | 0   | propose versions | map of version number -> params, ascending |
//! | 1   | accept version   | version number, params                     |
//! | 2   | refuse           | `[0, known-versions, client-tags]`,        |
//! |     |                  | `[1, version, text]` or `[2, version, text]` |
//!
//! A proposal decoded in the confirm state is surfaced as
//! [`HandshakeMessage::CrossedVersions`]: the remote also initiated.
//! Decoders reject empty, unsorted, or duplicate-keyed version maps,
//! indefinite-length items, and tags that are not legal from the state
//! the decode started in.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use minicbor::{Decoder, Encoder};

use super::{
    Handshake, HandshakeMessage, HandshakeState, RefuseReason, VersionMap, VersionNumber,
    VersionParams,
};
use crate::codec::cbor::CborDecode;
use crate::codec::{Codec, CodecError, MessageDecode};
use crate::limits::Limits;

const TAG_PROPOSE: u64 = 0;
const TAG_ACCEPT: u64 = 1;
const TAG_REFUSE: u64 = 2;

const REFUSE_VERSION_MISMATCH: u64 = 0;
const REFUSE_DECODE_FAILURE: u64 = 1;
const REFUSE_REFUSED: u64 = 2;

/// Codec for [`Handshake<D>`].
pub struct HandshakeCodec<D> {
    limits: Limits,
    _params: PhantomData<fn() -> D>,
}

impl<D> HandshakeCodec<D> {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            _params: PhantomData,
        }
    }
}

impl<D: VersionParams> Codec<Handshake<D>> for HandshakeCodec<D> {
    fn encode(
        &self,
        _state: &HandshakeState,
        message: &HandshakeMessage<D>,
    ) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        match message {
            HandshakeMessage::ProposeVersions(map) => {
                enc.array(2)?;
                enc.u64(TAG_PROPOSE)?;
                encode_version_map(&mut enc, map)?;
            }
            HandshakeMessage::CrossedVersions(_) => {
                return Err(CodecError::Encode(
                    "a crossed proposal is never sent on the wire".into(),
                ));
            }
            HandshakeMessage::AcceptVersion(version, params) => {
                enc.array(3)?;
                enc.u64(TAG_ACCEPT)?;
                enc.u64(version.get())?;
                params.encode_params(*version, &mut enc)?;
            }
            HandshakeMessage::Refuse(reason) => {
                enc.array(2)?;
                enc.u64(TAG_REFUSE)?;
                encode_refuse_reason(&mut enc, reason)?;
            }
        }
        Ok(buf)
    }

    fn start_decode(&self, state: &HandshakeState) -> Box<dyn MessageDecode<Handshake<D>>> {
        let state = *state;
        let limits = self.limits.clone();
        Box::new(CborDecode::new(
            self.limits.max_message_bytes,
            move |dec: &mut Decoder<'_>| decode_message::<D>(state, &limits, dec),
        ))
    }
}

fn encode_version_map<D: VersionParams>(
    enc: &mut Encoder<&mut Vec<u8>>,
    map: &VersionMap<D>,
) -> Result<(), CodecError> {
    if map.known().is_empty() {
        return Err(CodecError::Encode("version proposal is empty".into()));
    }
    enc.map(map.known().len() as u64)?;
    // BTreeMap iteration gives the required ascending key order.
    for (version, params) in map.known() {
        enc.u64(version.get())?;
        params.encode_params(*version, enc)?;
    }
    Ok(())
}

fn encode_refuse_reason(
    enc: &mut Encoder<&mut Vec<u8>>,
    reason: &RefuseReason,
) -> Result<(), CodecError> {
    match reason {
        RefuseReason::VersionMismatch {
            server_known,
            client_tags,
        } => {
            enc.array(3)?;
            enc.u64(REFUSE_VERSION_MISMATCH)?;
            enc.array(server_known.len() as u64)?;
            for version in server_known {
                enc.u64(version.get())?;
            }
            enc.array(client_tags.len() as u64)?;
            for tag in client_tags {
                enc.u64(*tag)?;
            }
        }
        RefuseReason::DecodeFailure { version, message } => {
            enc.array(3)?;
            enc.u64(REFUSE_DECODE_FAILURE)?;
            enc.u64(version.get())?;
            enc.str(message)?;
        }
        RefuseReason::Refused { version, message } => {
            enc.array(3)?;
            enc.u64(REFUSE_REFUSED)?;
            enc.u64(version.get())?;
            enc.str(message)?;
        }
    }
    Ok(())
}

fn decode_message<D: VersionParams>(
    state: HandshakeState,
    limits: &Limits,
    dec: &mut Decoder<'_>,
) -> Result<HandshakeMessage<D>, CodecError> {
    let len = decode_array_len(dec)?;
    let tag = dec.u64()?;
    match (state, tag) {
        (HandshakeState::Propose, TAG_PROPOSE) => {
            expect_arity("propose", len, 2)?;
            Ok(HandshakeMessage::ProposeVersions(decode_version_map(
                limits, dec,
            )?))
        }
        (HandshakeState::Confirm, TAG_PROPOSE) => {
            // Simultaneous open: the remote proposed where we expected a
            // verdict.
            expect_arity("propose", len, 2)?;
            Ok(HandshakeMessage::CrossedVersions(decode_version_map(
                limits, dec,
            )?))
        }
        (HandshakeState::Confirm, TAG_ACCEPT) => {
            expect_arity("accept", len, 3)?;
            let version = VersionNumber::new(dec.u64()?);
            if !D::known_version(version) {
                return Err(CodecError::UnknownVersion(version.get()));
            }
            let params = D::decode_params(version, dec)?;
            Ok(HandshakeMessage::AcceptVersion(version, params))
        }
        (HandshakeState::Confirm, TAG_REFUSE) => {
            expect_arity("refuse", len, 2)?;
            Ok(HandshakeMessage::Refuse(decode_refuse_reason(limits, dec)?))
        }
        (state, tag) => Err(CodecError::malformed(format!(
            "message tag {tag} is not legal in {state:?}"
        ))),
    }
}

fn decode_version_map<D: VersionParams>(
    limits: &Limits,
    dec: &mut Decoder<'_>,
) -> Result<VersionMap<D>, CodecError> {
    let entries = dec
        .map()?
        .ok_or_else(|| CodecError::malformed("indefinite-length version map"))?;
    if entries == 0 {
        return Err(CodecError::malformed("empty version map"));
    }
    if entries > limits.max_versions as u64 {
        return Err(CodecError::malformed(format!(
            "version map has {entries} entries, limit {}",
            limits.max_versions
        )));
    }

    let mut known = BTreeMap::new();
    let mut unknown = Vec::new();
    let mut previous: Option<u64> = None;
    for _ in 0..entries {
        let tag = dec.u64()?;
        if let Some(previous) = previous {
            if tag <= previous {
                return Err(CodecError::malformed(
                    "version keys not in ascending order",
                ));
            }
        }
        previous = Some(tag);

        let version = VersionNumber::new(tag);
        if D::known_version(version) {
            known.insert(version, D::decode_params(version, dec)?);
        } else {
            dec.skip()?;
            unknown.push(tag);
        }
    }
    Ok(VersionMap::from_parts(known, unknown))
}

fn decode_refuse_reason(limits: &Limits, dec: &mut Decoder<'_>) -> Result<RefuseReason, CodecError> {
    let len = decode_array_len(dec)?;
    let sub = dec.u64()?;
    match sub {
        REFUSE_VERSION_MISMATCH => {
            expect_arity("version-mismatch", len, 3)?;
            let server_known = decode_version_list(limits, dec)?;
            let client_tags = decode_tag_list(limits, dec)?;
            Ok(RefuseReason::VersionMismatch {
                server_known,
                client_tags,
            })
        }
        REFUSE_DECODE_FAILURE => {
            expect_arity("decode-failure", len, 3)?;
            let version = VersionNumber::new(dec.u64()?);
            let message = decode_refuse_text(limits, dec)?;
            Ok(RefuseReason::DecodeFailure { version, message })
        }
        REFUSE_REFUSED => {
            expect_arity("refused", len, 3)?;
            let version = VersionNumber::new(dec.u64()?);
            let message = decode_refuse_text(limits, dec)?;
            Ok(RefuseReason::Refused { version, message })
        }
        sub => Err(CodecError::malformed(format!(
            "unknown refuse reason tag {sub}"
        ))),
    }
}

fn decode_version_list(
    limits: &Limits,
    dec: &mut Decoder<'_>,
) -> Result<Vec<VersionNumber>, CodecError> {
    decode_tag_list(limits, dec).map(|tags| tags.into_iter().map(VersionNumber::new).collect())
}

fn decode_tag_list(limits: &Limits, dec: &mut Decoder<'_>) -> Result<Vec<u64>, CodecError> {
    let len = dec
        .array()?
        .ok_or_else(|| CodecError::malformed("indefinite-length version list"))?;
    if len > limits.max_versions as u64 {
        return Err(CodecError::malformed(format!(
            "version list has {len} entries, limit {}",
            limits.max_versions
        )));
    }
    let mut tags = Vec::with_capacity(len as usize);
    for _ in 0..len {
        tags.push(dec.u64()?);
    }
    Ok(tags)
}

fn decode_refuse_text(limits: &Limits, dec: &mut Decoder<'_>) -> Result<String, CodecError> {
    let text = dec.str()?;
    if text.len() > limits.max_refuse_text_bytes {
        return Err(CodecError::malformed(format!(
            "refusal text is {} bytes, limit {}",
            text.len(),
            limits.max_refuse_text_bytes
        )));
    }
    Ok(text.to_string())
}

fn decode_array_len(dec: &mut Decoder<'_>) -> Result<u64, CodecError> {
    dec.array()?
        .ok_or_else(|| CodecError::malformed("indefinite-length message"))
}

fn expect_arity(what: &str, got: u64, want: u64) -> Result<(), CodecError> {
    if got == want {
        Ok(())
    } else {
        Err(CodecError::malformed(format!(
            "{what} message has {got} elements, expected {want}"
        )))
    }
}
