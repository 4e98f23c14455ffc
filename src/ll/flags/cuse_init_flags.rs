use bitflags::bitflags;

bitflags! {
    /// CUSE INIT request/reply flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CuseInitFlags: u32 {
        /// Indicates the daemon should not impose any restriction on the ioctl commands
        /// forwarded to it through `/dev/cuse`.
        const CUSE_UNRESTRICTED_IOCTL = 1 << 0;
    }
}
