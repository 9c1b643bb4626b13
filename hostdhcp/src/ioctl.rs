use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd};

use socket2::{Domain, Socket, Type};

use crate::mac::MacAddr;

fn interface_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name {name:?}"),
        ));
    }

    CString::new(name).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

// https://www.man7.org/linux/man-pages/man3/if_nametoindex.3.html
pub fn interface_index(name: &str) -> io::Result<u32> {
    let name = interface_name(name)?;

    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(index)
    }
}

// https://www.man7.org/linux/man-pages/man7/netdevice.7.html
pub fn hardware_addr(socket: impl AsFd, name: &str) -> io::Result<MacAddr> {
    let name = interface_name(name)?;

    let mut req: libc::ifreq = unsafe { core::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    let fd = socket.as_fd().as_raw_fd();
    let res = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR as _, &mut req) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }

    let data = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data };
    let mut octets = [0; 6];
    for (dst, src) in octets.iter_mut().zip(data.iter()) {
        *dst = *src as u8;
    }

    Ok(MacAddr::from_octets(octets))
}

/// Looks up the hardware address of `name` through a throwaway socket.
pub fn interface_mac(name: &str) -> io::Result<MacAddr> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    hardware_addr(&socket, name)
}

#[cfg(test)]
mod tests {
    use super::{interface_index, interface_name};

    #[test]
    fn rejects_bad_names() {
        assert!(interface_name("").is_err());
        assert!(interface_name("a-very-long-interface-name").is_err());
        assert!(interface_name("br\0x").is_err());
        assert!(interface_name("br0").is_ok());
    }

    #[test]
    fn unknown_interface_has_no_index() {
        assert!(interface_index("nosuchif0").is_err());
    }
}
