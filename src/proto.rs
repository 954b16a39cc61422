//! Wire schemas
//!
//! Protocol-buffer messages spoken on the provisioning socket, the
//! authenticated socket and inside provisioning envelopes. Declared with
//! `prost` derives so no `protoc` step is needed at build time.
//!
//! Field tags follow the server's `.proto` definitions; fields are declared
//! without presence tracking, so an absent field decodes to its default.

/// One binary websocket frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebSocketMessage {
    #[prost(enumeration = "web_socket_message::Type", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub request: ::core::option::Option<WebSocketRequestMessage>,
    #[prost(message, optional, tag = "3")]
    pub response: ::core::option::Option<WebSocketResponseMessage>,
}

pub mod web_socket_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Unknown = 0,
        Request = 1,
        Response = 2,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebSocketRequestMessage {
    #[prost(string, tag = "1")]
    pub verb: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub path: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub id: u64,
    #[prost(string, repeated, tag = "5")]
    pub headers: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebSocketResponseMessage {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint32, tag = "2")]
    pub status: u32,
    #[prost(string, tag = "3")]
    pub message: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "4")]
    pub body: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, repeated, tag = "5")]
    pub headers: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Body of the server's `PUT /v1/address` request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProvisioningUuid {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
}

/// Body of the server's `PUT /v1/message` request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProvisionEnvelope {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}

/// Decrypted provisioning payload sent by the primary device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProvisionMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub aci_identity_key_public: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub aci_identity_key_private: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "3")]
    pub number: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub provisioning_code: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub user_agent: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "6")]
    pub profile_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "7")]
    pub read_receipts: bool,
    #[prost(string, tag = "8")]
    pub aci: ::prost::alloc::string::String,
    #[prost(uint32, tag = "9")]
    pub provisioning_version: u32,
    #[prost(string, tag = "10")]
    pub pni: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "11")]
    pub pni_identity_key_public: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "12")]
    pub pni_identity_key_private: ::prost::alloc::vec::Vec<u8>,
}

/// Server-pushed message envelope (`PUT /api/v1/message`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(enumeration = "envelope::Type", tag = "1")]
    pub r#type: i32,
    #[prost(uint64, tag = "5")]
    pub timestamp: u64,
    #[prost(uint32, tag = "7")]
    pub source_device: u32,
    #[prost(bytes = "vec", tag = "8")]
    pub content: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "9")]
    pub server_guid: ::prost::alloc::string::String,
    #[prost(string, tag = "11")]
    pub source_service_id: ::prost::alloc::string::String,
    #[prost(string, tag = "13")]
    pub destination_service_id: ::prost::alloc::string::String,
}

pub mod envelope {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Unknown = 0,
        Ciphertext = 1,
        PrekeyBundle = 3,
        Receipt = 5,
        UnidentifiedSender = 6,
        PlaintextContent = 8,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Content {
    #[prost(message, optional, tag = "1")]
    pub data_message: ::core::option::Option<DataMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataMessage {
    #[prost(string, tag = "1")]
    pub body: ::prost::alloc::string::String,
    #[prost(uint64, tag = "7")]
    pub timestamp: u64,
    #[prost(message, optional, tag = "15")]
    pub group_v2: ::core::option::Option<GroupContextV2>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GroupContextV2 {
    #[prost(bytes = "vec", tag = "1")]
    pub master_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub revision: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_request_frame_wire_tags() {
        let frame = WebSocketMessage {
            r#type: web_socket_message::Type::Request as i32,
            request: Some(WebSocketRequestMessage {
                verb: "PUT".to_string(),
                path: "/v1/address".to_string(),
                body: vec![],
                id: 7,
                headers: vec![],
            }),
            response: None,
        };

        let bytes = frame.encode_to_vec();
        // field 1, varint, value 1 (REQUEST)
        assert_eq!(&bytes[..2], &[0x08, 0x01]);
        assert_eq!(WebSocketMessage::decode(bytes.as_slice()).unwrap(), frame);
    }

    #[test]
    fn test_unknown_enum_value_is_rejected_by_try_from() {
        assert!(web_socket_message::Type::try_from(42).is_err());
        assert_eq!(
            web_socket_message::Type::try_from(2).unwrap(),
            web_socket_message::Type::Response
        );
    }
}
