//! Dynamic message codec.
//!
//! Requests and responses are `DynamicMessage`s described by the compiled
//! catalog. User code sees them as JSON values; `JsonMapping` controls how
//! 64-bit integers, enums, field names and default values are rendered.

use prost::Message;
use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions};
use serde_json::Value;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

use crate::config::{EnumEncoding, LongEncoding, ProtoOptions};

/// gRPC codec for messages only known at runtime.
///
/// Encoding works for any `DynamicMessage`; decoding needs the expected
/// message type, which is the method input on servers and the method output
/// on clients.
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    decode_as: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(decode_as: MessageDescriptor) -> Self {
        Self { decode_as }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.decode_as.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("Failed to encode message: {}", e)))
    }
}

#[derive(Debug, Clone)]
pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        DynamicMessage::decode(self.0.clone(), src)
            .map(Some)
            .map_err(|e| Status::internal(format!("Failed to decode message: {}", e)))
    }
}

/// JSON rendering of dynamic messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonMapping {
    longs_as_strings: bool,
    enums_as_numbers: bool,
    keep_case: bool,
    defaults: bool,
}

impl Default for JsonMapping {
    fn default() -> Self {
        Self::from(&ProtoOptions::default())
    }
}

impl From<&ProtoOptions> for JsonMapping {
    fn from(options: &ProtoOptions) -> Self {
        Self {
            longs_as_strings: options.longs == LongEncoding::String,
            enums_as_numbers: options.enums == EnumEncoding::Number,
            keep_case: options.keep_case,
            defaults: options.defaults,
        }
    }
}

impl JsonMapping {
    fn serialize_options(&self) -> SerializeOptions {
        SerializeOptions::new()
            .stringify_64_bit_integers(self.longs_as_strings)
            .use_enum_numbers(self.enums_as_numbers)
            .use_proto_field_name(self.keep_case)
            .skip_default_fields(!self.defaults)
    }

    /// Render a message as JSON.
    pub fn to_json(&self, message: &DynamicMessage) -> Result<Value, Status> {
        message
            .serialize_with_options(serde_json::value::Serializer, &self.serialize_options())
            .map_err(|e| Status::internal(format!("Failed to render message: {}", e)))
    }

    /// Build a message of the given type from JSON.
    ///
    /// Unknown fields are ignored; both proto and JSON field names are accepted.
    pub fn from_json(
        &self,
        descriptor: MessageDescriptor,
        value: Value,
    ) -> Result<DynamicMessage, Status> {
        let options = DeserializeOptions::new().deny_unknown_fields(false);
        DynamicMessage::deserialize_with_options(descriptor, value, &options)
            .map_err(|e| Status::invalid_argument(format!("Invalid message: {}", e)))
    }
}
