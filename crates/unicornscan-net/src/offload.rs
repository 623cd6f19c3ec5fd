//! Receive-offload control for capture interfaces
//!
//! GRO and LRO coalesce inbound segments in the NIC or driver, which makes
//! `ip.tot_len` exceed the captured length and breaks per-packet parsing in
//! the listener. On Linux both are switched off for the capture interface at
//! listener startup via the ethtool ioctls and restored on exit; the guard's
//! Drop does the restore. Other platforms get a no-op guard.

#[cfg(target_os = "linux")]
mod linux {
    use tracing::{debug, warn};
    use unicornscan_core::{Error, Result};

    const SIOCETHTOOL: libc::c_ulong = 0x8946;
    const ETHTOOL_GGRO: u32 = 0x0000002b;
    const ETHTOOL_SGRO: u32 = 0x0000002c;
    const ETHTOOL_GFLAGS: u32 = 0x00000025;
    const ETHTOOL_SFLAGS: u32 = 0x00000026;
    const ETH_FLAG_LRO: u32 = 0x8000;

    #[repr(C)]
    struct EthtoolValue {
        cmd: u32,
        data: u32,
    }

    fn ethtool_ioctl(iface: &str, value: &mut EthtoolValue) -> Result<()> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(Error::Network("cannot open ethtool socket".to_string()));
        }

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let name_bytes = iface.as_bytes();
        if name_bytes.len() >= ifr.ifr_name.len() {
            unsafe { libc::close(fd) };
            return Err(Error::Network(format!("interface name too long: {}", iface)));
        }
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name_bytes) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_data = value as *mut EthtoolValue as *mut libc::c_char;

        let ret = unsafe { libc::ioctl(fd, SIOCETHTOOL, &mut ifr) };
        unsafe { libc::close(fd) };

        if ret < 0 {
            return Err(Error::Network(format!(
                "ethtool ioctl failed on {}: {}",
                iface,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn get_gro(iface: &str) -> Result<u32> {
        let mut value = EthtoolValue {
            cmd: ETHTOOL_GGRO,
            data: 0,
        };
        ethtool_ioctl(iface, &mut value)?;
        Ok(value.data)
    }

    fn set_gro(iface: &str, enabled: u32) -> Result<()> {
        let mut value = EthtoolValue {
            cmd: ETHTOOL_SGRO,
            data: enabled,
        };
        ethtool_ioctl(iface, &mut value)
    }

    fn get_flags(iface: &str) -> Result<u32> {
        let mut value = EthtoolValue {
            cmd: ETHTOOL_GFLAGS,
            data: 0,
        };
        ethtool_ioctl(iface, &mut value)?;
        Ok(value.data)
    }

    fn set_flags(iface: &str, flags: u32) -> Result<()> {
        let mut value = EthtoolValue {
            cmd: ETHTOOL_SFLAGS,
            data: flags,
        };
        ethtool_ioctl(iface, &mut value)
    }

    /// RAII guard: offloads disabled while alive, restored on drop.
    pub struct OffloadGuard {
        iface: String,
        saved_gro: Option<u32>,
        saved_lro_flags: Option<u32>,
    }

    impl OffloadGuard {
        /// Disable GRO and LRO on `iface`. Failures (virtual devices,
        /// missing privileges) are logged and skipped; capture still works,
        /// merely with the coalescing risk.
        pub fn disable(iface: &str) -> Self {
            let mut guard = Self {
                iface: iface.to_string(),
                saved_gro: None,
                saved_lro_flags: None,
            };

            match get_gro(iface) {
                Ok(1) => {
                    if set_gro(iface, 0).is_ok() {
                        debug!(iface, "disabled GRO for capture");
                        guard.saved_gro = Some(1);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(iface, "cannot query GRO: {}", e),
            }

            match get_flags(iface) {
                Ok(flags) if flags & ETH_FLAG_LRO != 0 => {
                    if set_flags(iface, flags & !ETH_FLAG_LRO).is_ok() {
                        debug!(iface, "disabled LRO for capture");
                        guard.saved_lro_flags = Some(flags);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(iface, "cannot query offload flags: {}", e),
            }

            guard
        }
    }

    impl Drop for OffloadGuard {
        fn drop(&mut self) {
            if let Some(gro) = self.saved_gro {
                if let Err(e) = set_gro(&self.iface, gro) {
                    warn!(iface = %self.iface, "cannot restore GRO: {}", e);
                }
            }
            if let Some(flags) = self.saved_lro_flags {
                if let Err(e) = set_flags(&self.iface, flags) {
                    warn!(iface = %self.iface, "cannot restore LRO: {}", e);
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::OffloadGuard;

/// No-op guard for platforms without the ethtool interface.
#[cfg(not(target_os = "linux"))]
pub struct OffloadGuard;

#[cfg(not(target_os = "linux"))]
impl OffloadGuard {
    pub fn disable(_iface: &str) -> Self {
        OffloadGuard
    }
}
