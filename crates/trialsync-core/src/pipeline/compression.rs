//! Payload compression for remote writes.
//!
//! Every encoded payload starts with one tag byte: [`TAG_IDENTITY`] for raw
//! bytes, [`TAG_DEFLATE`] for a DEFLATE stream. The compressed form is kept
//! only when it is actually smaller, so decoding never depends on whether
//! compression was attempted.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::FieldChanges;

pub const TAG_IDENTITY: u8 = 0x00;
pub const TAG_DEFLATE: u8 = 0x01;

/// Compression tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Payloads shorter than this are never compressed
    pub min_size: usize,
    /// DEFLATE level (0-9)
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: 256,
            level: 6,
        }
    }
}

/// Body of a field write. Compressed and raw writes carry the same shape.
#[derive(Debug, Serialize)]
pub struct WriteBody<'a> {
    pub fields: &'a FieldChanges,
}

#[derive(Deserialize)]
struct OwnedWriteBody {
    fields: FieldChanges,
}

/// A field-changes payload ready for transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPayload {
    /// Decoded form, for transports that send JSON directly
    pub fields: FieldChanges,
    /// Tagged wire form of the [`WriteBody`]
    pub bytes: Vec<u8>,
    /// Length of the uncompressed JSON body
    pub original_len: usize,
}

impl EncodedPayload {
    pub fn is_compressed(&self) -> bool {
        self.bytes.first() == Some(&TAG_DEFLATE)
    }

    /// Bytes saved on the wire relative to the raw JSON.
    pub fn bytes_saved(&self) -> u64 {
        let sent = self.bytes.len().saturating_sub(1);
        u64::try_from(self.original_len.saturating_sub(sent)).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub const fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Tag and, when worthwhile, deflate `data`.
    pub fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() >= self.config.min_size {
            let mut encoder = DeflateEncoder::new(
                Vec::with_capacity(data.len() / 2 + 1),
                Compression::new(self.config.level.min(9)),
            );
            encoder
                .write_all(data)
                .map_err(|error| Error::Compression(error.to_string()))?;
            let deflated = encoder
                .finish()
                .map_err(|error| Error::Compression(error.to_string()))?;
            if deflated.len() < data.len() {
                let mut out = Vec::with_capacity(deflated.len() + 1);
                out.push(TAG_DEFLATE);
                out.extend_from_slice(&deflated);
                return Ok(out);
            }
        }
        Ok(identity(data))
    }

    /// Inverse of [`Compressor::compress_bytes`].
    pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>> {
        match data.split_first() {
            Some((&TAG_IDENTITY, body)) => Ok(body.to_vec()),
            Some((&TAG_DEFLATE, body)) => {
                let mut out = Vec::new();
                DeflateDecoder::new(body)
                    .read_to_end(&mut out)
                    .map_err(|error| Error::Compression(error.to_string()))?;
                Ok(out)
            }
            Some((tag, _)) => Err(Error::Compression(format!("unknown payload tag {tag:#04x}"))),
            None => Err(Error::Compression("empty payload".to_string())),
        }
    }

    pub fn compress_value(&self, value: &Value) -> Result<Vec<u8>> {
        self.compress_bytes(&serde_json::to_vec(value)?)
    }

    pub fn decompress_value(data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(&Self::decompress_bytes(data)?)?)
    }

    /// Serialize `fields` as a [`WriteBody`] and compress it when `enabled`.
    pub fn encode(&self, fields: &FieldChanges, enabled: bool) -> Result<EncodedPayload> {
        let json = serde_json::to_vec(&WriteBody { fields })?;
        self.encode_serialized(fields, &json, enabled)
    }

    /// Like [`Compressor::encode`] for callers that already hold the
    /// serialized [`WriteBody`], e.g. in a pooled buffer.
    pub fn encode_serialized(
        &self,
        fields: &FieldChanges,
        json: &[u8],
        enabled: bool,
    ) -> Result<EncodedPayload> {
        let bytes = if enabled {
            self.compress_bytes(json)?
        } else {
            identity(json)
        };
        Ok(EncodedPayload {
            fields: fields.clone(),
            original_len: json.len(),
            bytes,
        })
    }

    /// Inverse of [`Compressor::encode`].
    pub fn decode(data: &[u8]) -> Result<FieldChanges> {
        let body: OwnedWriteBody = serde_json::from_slice(&Self::decompress_bytes(data)?)?;
        Ok(body.fields)
    }
}

fn identity(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(TAG_IDENTITY);
    out.extend_from_slice(data);
    out
}
