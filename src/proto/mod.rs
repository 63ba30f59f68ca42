//! Image entry messages, wire-compatible with the proto2 image schema.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InventoryEntry {
    #[prost(uint32, required, tag = "1")]
    pub img_version: u32,
    #[prost(bool, optional, tag = "2")]
    pub fdinfo_per_id: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub ns_per_id: ::core::option::Option<bool>,
    #[prost(uint32, optional, tag = "5")]
    pub root_cg_set: ::core::option::Option<u32>,
    #[prost(bool, optional, tag = "10")]
    pub tcp_close: ::core::option::Option<bool>,
    #[prost(uint32, optional, tag = "11")]
    pub network_lock_method: ::core::option::Option<u32>,
    #[prost(string, optional, tag = "14")]
    pub dump_criu_run_id: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PstreeEntry {
    #[prost(uint32, required, tag = "1")]
    pub pid: u32,
    #[prost(uint32, required, tag = "2")]
    pub ppid: u32,
    #[prost(uint32, required, tag = "3")]
    pub pgid: u32,
    #[prost(uint32, required, tag = "4")]
    pub sid: u32,
    #[prost(uint32, repeated, packed = "false", tag = "5")]
    pub threads: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegFileEntry {
    #[prost(uint32, required, tag = "1")]
    pub id: u32,
    #[prost(uint32, required, tag = "2")]
    pub flags: u32,
    #[prost(uint64, required, tag = "3")]
    pub pos: u64,
    #[prost(string, required, tag = "6")]
    pub name: ::prost::alloc::string::String,
    #[prost(sint32, optional, tag = "7")]
    pub mnt_id: ::core::option::Option<i32>,
    #[prost(uint64, optional, tag = "8")]
    pub size: ::core::option::Option<u64>,
    #[prost(uint32, optional, tag = "10")]
    pub mode: ::core::option::Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RemapType {
    Linked = 0,
    Ghost = 1,
    Procfs = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemapFilePathEntry {
    #[prost(uint32, required, tag = "1")]
    pub orig_id: u32,
    #[prost(uint32, required, tag = "2")]
    pub remap_id: u32,
    #[prost(enumeration = "RemapType", optional, tag = "3")]
    pub remap_type: ::core::option::Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GhostFileEntry {
    #[prost(uint32, required, tag = "1")]
    pub uid: u32,
    #[prost(uint32, required, tag = "2")]
    pub gid: u32,
    #[prost(uint32, required, tag = "3")]
    pub mode: u32,
    #[prost(uint32, optional, tag = "4")]
    pub dev: ::core::option::Option<u32>,
    #[prost(uint64, optional, tag = "5")]
    pub ino: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "10")]
    pub size: ::core::option::Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MntEntry {
    #[prost(uint32, required, tag = "1")]
    pub fstype: u32,
    #[prost(uint32, required, tag = "2")]
    pub mnt_id: u32,
    #[prost(uint32, required, tag = "3")]
    pub root_dev: u32,
    #[prost(uint32, required, tag = "4")]
    pub parent_mnt_id: u32,
    #[prost(uint32, required, tag = "5")]
    pub flags: u32,
    #[prost(string, required, tag = "6")]
    pub root: ::prost::alloc::string::String,
    #[prost(string, required, tag = "7")]
    pub mountpoint: ::prost::alloc::string::String,
    #[prost(string, required, tag = "8")]
    pub source: ::prost::alloc::string::String,
    #[prost(string, required, tag = "9")]
    pub options: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "14")]
    pub fsname: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InetSkEntry {
    #[prost(uint32, required, tag = "1")]
    pub id: u32,
    #[prost(uint32, required, tag = "2")]
    pub ino: u32,
    #[prost(uint32, required, tag = "3")]
    pub family: u32,
    #[prost(uint32, required, tag = "4")]
    pub r#type: u32,
    #[prost(uint32, required, tag = "5")]
    pub proto: u32,
    #[prost(uint32, required, tag = "6")]
    pub state: u32,
    #[prost(uint32, required, tag = "7")]
    pub src_port: u32,
    #[prost(uint32, required, tag = "8")]
    pub dst_port: u32,
    #[prost(uint32, required, tag = "9")]
    pub flags: u32,
    #[prost(uint32, required, tag = "10")]
    pub backlog: u32,
    #[prost(uint32, repeated, packed = "false", tag = "11")]
    pub src_addr: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "12")]
    pub dst_addr: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, optional, tag = "18")]
    pub ns_id: ::core::option::Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TcpStreamEntry {
    #[prost(uint32, required, tag = "1")]
    pub inq_len: u32,
    #[prost(uint32, required, tag = "2")]
    pub inq_seq: u32,
    #[prost(uint32, required, tag = "3")]
    pub outq_len: u32,
    #[prost(uint32, required, tag = "4")]
    pub outq_seq: u32,
    #[prost(uint32, required, tag = "5")]
    pub opt_mask: u32,
    #[prost(uint32, required, tag = "6")]
    pub snd_wscale: u32,
    #[prost(uint32, required, tag = "7")]
    pub mss_clamp: u32,
    #[prost(uint32, optional, tag = "8")]
    pub rcv_wscale: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "9")]
    pub timestamp: ::core::option::Option<u32>,
    #[prost(bool, optional, tag = "10")]
    pub cork: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "11")]
    pub nodelay: ::core::option::Option<bool>,
    #[prost(uint32, optional, tag = "12")]
    pub unsq_len: ::core::option::Option<u32>,
}
