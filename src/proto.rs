//! Wire messages exchanged with the IOMgr database engine.
//!
//! The messages are hand-written `prost` structs rather than generated code:
//! the schema is small and stable, and keeping it in Rust avoids a protoc
//! build step. Field numbers are part of the wire contract and must not be
//! reordered.

/// REST verb carried inside a [`RestRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RestVerb {
    Get = 0,
    Post = 1,
    Delete = 2,
    Patch = 3,
}

/// Kind of database object a [`RestRequest`] addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DatabaseObjectType {
    Database = 0,
    Table = 1,
    Row = 2,
    Sql = 3,
}

/// Request sent to the IOMgr for every REST operation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RestRequest {
    /// Per-connection sequence number; echoed back in [`Response`].
    #[prost(uint64, tag = "1")]
    pub request_id: u64,

    #[prost(enumeration = "RestVerb", tag = "2")]
    pub verb: i32,

    #[prost(enumeration = "DatabaseObjectType", tag = "3")]
    pub object_type: i32,

    #[prost(string, tag = "4")]
    pub user_name: String,

    #[prost(string, tag = "5")]
    pub token: String,

    /// Object name, e.g. `db.table` for rows; absent for the database list.
    #[prost(string, optional, tag = "6")]
    pub object_name: Option<String>,

    /// Row identifier for single-row operations; absent otherwise.
    #[prost(uint64, optional, tag = "7")]
    pub object_id: Option<u64>,
}

/// One status entry inside a [`Response`]; a non-empty list means the engine
/// rejected the request at the application level.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusMessage {
    #[prost(int32, tag = "1")]
    pub status_code: i32,

    #[prost(string, tag = "2")]
    pub text: String,
}

/// Response read from the IOMgr after a [`RestRequest`] (and, for write
/// verbs, again after the payload chunk stream).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// Must equal the `request_id` of the most recent request on the
    /// connection; a mismatch is fatal for the connection.
    #[prost(uint64, tag = "1")]
    pub request_id: u64,

    /// HTTP-like status the gateway forwards to the client.
    #[prost(uint32, tag = "2")]
    pub rest_status_code: u32,

    #[prost(message, repeated, tag = "3")]
    pub message: Vec<StatusMessage>,
}
