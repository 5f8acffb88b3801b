//! Flags carried by each `dyncall_table` entry in guest memory.

use bitflags::bitflags;

bitflags! {
    /// Per-entry restrictions read from the guest's dynamic-call table.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DynCallFlags: u8 {
        /// Only callable while the instance is still booting.
        const INIT_ONLY = 1 << 0;
        /// Only callable from a client-role instance.
        const CLIENT_ONLY = 1 << 1;
        /// Only callable from a server-role instance.
        const SERVER_ONLY = 1 << 2;
    }
}

impl DynCallFlags {
    pub fn from_table_bytes(init_only: u8, client_only: u8, server_only: u8) -> Self {
        let mut flags = DynCallFlags::empty();
        if init_only != 0 {
            flags |= DynCallFlags::INIT_ONLY;
        }
        if client_only != 0 {
            flags |= DynCallFlags::CLIENT_ONLY;
        }
        if server_only != 0 {
            flags |= DynCallFlags::SERVER_ONLY;
        }
        flags
    }

    pub fn is_init_only(self) -> bool {
        self.contains(DynCallFlags::INIT_ONLY)
    }

    pub fn is_client_only(self) -> bool {
        self.contains(DynCallFlags::CLIENT_ONLY)
    }

    pub fn is_server_only(self) -> bool {
        self.contains(DynCallFlags::SERVER_ONLY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_table_bytes() {
        let flags = DynCallFlags::from_table_bytes(1, 0, 1);
        assert!(flags.is_init_only());
        assert!(!flags.is_client_only());
        assert!(flags.is_server_only());
    }

    #[test]
    fn default_is_unrestricted() {
        let flags = DynCallFlags::default();
        assert!(!flags.is_init_only());
        assert!(!flags.is_client_only());
        assert!(!flags.is_server_only());
    }
}
