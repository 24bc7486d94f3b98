//! Protobuf structures shared by every bitswap protocol revision.
//!
//! The 1.0.0 decoder only ever sees `wantlist` and `blocks`; 1.1.0 and
//! 1.2.0 use `payload`, `block_presences` and `pending_bytes` instead of
//! `blocks`. Kept as checked-in prost structs so builds do not depend on
//! protoc.

pub mod bitswap_pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Message {
        #[prost(message, optional, tag = "1")]
        pub wantlist: ::core::option::Option<message::Wantlist>,
        /// Raw block bytes, 1.0.0 only.
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub blocks: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
        /// Prefixed blocks, 1.1.0 and later.
        #[prost(message, repeated, tag = "3")]
        pub payload: ::prost::alloc::vec::Vec<message::Block>,
        #[prost(message, repeated, tag = "4")]
        pub block_presences: ::prost::alloc::vec::Vec<message::BlockPresence>,
        #[prost(int32, tag = "5")]
        pub pending_bytes: i32,
    }
    /// Nested message and enum types in `Message`.
    pub mod message {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Wantlist {
            #[prost(message, repeated, tag = "1")]
            pub entries: ::prost::alloc::vec::Vec<wantlist::Entry>,
            #[prost(bool, tag = "2")]
            pub full: bool,
        }
        /// Nested message and enum types in `Wantlist`.
        pub mod wantlist {
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct Entry {
                /// The legacy multihash (1.0.0) or full cid (1.1.0+) of the want.
                #[prost(bytes = "vec", tag = "1")]
                pub block: ::prost::alloc::vec::Vec<u8>,
                #[prost(int32, tag = "2")]
                pub priority: i32,
                #[prost(bool, tag = "3")]
                pub cancel: bool,
                #[prost(enumeration = "WantType", tag = "4")]
                pub want_type: i32,
                #[prost(bool, tag = "5")]
                pub send_dont_have: bool,
            }
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
            #[repr(i32)]
            pub enum WantType {
                Block = 0,
                Have = 1,
            }
        }
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Block {
            /// The cid minus the digest: version, codec, multihash type and length.
            #[prost(bytes = "vec", tag = "1")]
            pub prefix: ::prost::alloc::vec::Vec<u8>,
            #[prost(bytes = "vec", tag = "2")]
            pub data: ::prost::alloc::vec::Vec<u8>,
        }
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct BlockPresence {
            #[prost(bytes = "vec", tag = "1")]
            pub cid: ::prost::alloc::vec::Vec<u8>,
            #[prost(enumeration = "BlockPresenceType", tag = "2")]
            pub r#type: i32,
        }
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum BlockPresenceType {
            Have = 0,
            DontHave = 1,
        }
    }
}
