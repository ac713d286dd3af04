//! `google.rpc`, `google.longrunning` and `google.bytestream` messages.

pub mod rpc {
    /// `google.rpc.Status`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: String,
        #[prost(message, repeated, tag = "3")]
        pub details: Vec<::prost_types::Any>,
    }

    impl Status {
        /// Whether the status is `OK`
        #[must_use]
        pub fn is_ok(&self) -> bool {
            self.code == 0
        }
    }
}

pub mod longrunning {
    /// `google.longrunning.Operation`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Operation {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, optional, tag = "2")]
        pub metadata: Option<::prost_types::Any>,
        #[prost(bool, tag = "3")]
        pub done: bool,
        #[prost(oneof = "operation::Result", tags = "4, 5")]
        pub result: Option<operation::Result>,
    }

    /// Nested types of [`Operation`].
    pub mod operation {
        /// Outcome of a finished operation.
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(message, tag = "4")]
            Error(super::super::rpc::Status),
            #[prost(message, tag = "5")]
            Response(::prost_types::Any),
        }
    }
}

pub mod bytestream {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadRequest {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(int64, tag = "2")]
        pub read_offset: i64,
        #[prost(int64, tag = "3")]
        pub read_limit: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadResponse {
        #[prost(bytes = "vec", tag = "10")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteRequest {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(int64, tag = "2")]
        pub write_offset: i64,
        #[prost(bool, tag = "3")]
        pub finish_write: bool,
        #[prost(bytes = "vec", tag = "10")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteResponse {
        #[prost(int64, tag = "1")]
        pub committed_size: i64,
    }
}
