pub mod cr_restore;
pub mod crtools;
pub mod files_reg;
pub mod image;
pub mod image_desc;
pub mod inventory;
pub mod log;
pub mod mount;
pub mod netfilter;
pub mod options;
pub mod protobuf;
pub mod pstree;
pub mod rst_malloc;
pub mod sk_tcp;
pub mod sockets;
pub mod stats;
pub mod util;
