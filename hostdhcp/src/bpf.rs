//! Classic BPF programs for link-layer sockets.
//!
//! Instruction sequences match what `tcpdump -dd` emits for the equivalent
//! expressions, so they can be checked against it.

use std::io;
use std::os::fd::{AsFd, AsRawFd};

use crate::frame::{ETHERTYPE_IPV4, ETHERTYPE_IPV6, IPPROTO_ICMPV6, IPPROTO_UDP};

const LD_H_ABS: u16 = 0x28;
const LD_B_ABS: u16 = 0x30;
const LD_H_IND: u16 = 0x48;
const LDX_B_MSH: u16 = 0xb1;
const JEQ_K: u16 = 0x15;
const JSET_K: u16 = 0x45;
const RET_K: u16 = 0x06;

const ACCEPT: u32 = 0x0004_0000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Insn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const fn insn(code: u16, jt: u8, jf: u8, k: u32) -> Insn {
    Insn { code, jt, jf, k }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    insns: Vec<Insn>,
}

impl Filter {
    /// `ip and udp dst port <port>`
    pub fn udp4_dst_port(port: u16) -> Self {
        Self {
            insns: vec![
                insn(LD_H_ABS, 0, 0, 12),
                insn(JEQ_K, 0, 8, ETHERTYPE_IPV4.into()),
                insn(LD_B_ABS, 0, 0, 23),
                insn(JEQ_K, 0, 6, IPPROTO_UDP.into()),
                insn(LD_H_ABS, 0, 0, 20),
                insn(JSET_K, 4, 0, 0x1fff),
                insn(LDX_B_MSH, 0, 0, 14),
                insn(LD_H_IND, 0, 0, 16),
                insn(JEQ_K, 0, 1, port.into()),
                insn(RET_K, 0, 0, ACCEPT),
                insn(RET_K, 0, 0, 0),
            ],
        }
    }

    /// `ip6 and udp dst port <port>`, without extension headers.
    pub fn udp6_dst_port(port: u16) -> Self {
        Self {
            insns: vec![
                insn(LD_H_ABS, 0, 0, 12),
                insn(JEQ_K, 0, 5, ETHERTYPE_IPV6.into()),
                insn(LD_B_ABS, 0, 0, 20),
                insn(JEQ_K, 0, 3, IPPROTO_UDP.into()),
                insn(LD_H_ABS, 0, 0, 56),
                insn(JEQ_K, 0, 1, port.into()),
                insn(RET_K, 0, 0, ACCEPT),
                insn(RET_K, 0, 0, 0),
            ],
        }
    }

    /// `icmp6`, without extension headers.
    pub fn icmpv6() -> Self {
        Self {
            insns: vec![
                insn(LD_H_ABS, 0, 0, 12),
                insn(JEQ_K, 0, 3, ETHERTYPE_IPV6.into()),
                insn(LD_B_ABS, 0, 0, 20),
                insn(JEQ_K, 0, 1, IPPROTO_ICMPV6.into()),
                insn(RET_K, 0, 0, ACCEPT),
                insn(RET_K, 0, 0, 0),
            ],
        }
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    // https://www.kernel.org/doc/html/latest/networking/filter.html
    pub fn attach(&self, socket: impl AsFd) -> io::Result<()> {
        let mut program: Vec<libc::sock_filter> = self
            .insns
            .iter()
            .map(|i| libc::sock_filter {
                code: i.code,
                jt: i.jt,
                jf: i.jf,
                k: i.k,
            })
            .collect();

        let fprog = libc::sock_fprog {
            len: program.len() as libc::c_ushort,
            filter: program.as_mut_ptr(),
        };

        let res = unsafe {
            libc::setsockopt(
                socket.as_fd().as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const libc::sock_fprog as *const libc::c_void,
                core::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };

        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Filter, JEQ_K, JSET_K, RET_K};

    // Every conditional jump must land inside the program, and the
    // program must end in a return.
    fn assert_well_formed(filter: &Filter) {
        let insns = filter.insns();
        for (pc, insn) in insns.iter().enumerate() {
            if insn.code == JEQ_K || insn.code == JSET_K {
                assert!(pc + 1 + usize::from(insn.jt) < insns.len());
                assert!(pc + 1 + usize::from(insn.jf) < insns.len());
            }
        }
        assert_eq!(insns.last().map(|i| (i.code, i.k)), Some((RET_K, 0)));
    }

    #[test]
    fn programs_are_well_formed() {
        assert_well_formed(&Filter::udp4_dst_port(67));
        assert_well_formed(&Filter::udp6_dst_port(547));
        assert_well_formed(&Filter::icmpv6());
    }

    #[test]
    fn udp4_matches_port() {
        let filter = Filter::udp4_dst_port(67);
        assert_eq!(filter.insns()[8].k, 67);
        // Rejecting branches all land on the final `ret #0`.
        assert_eq!(1 + 1 + filter.insns()[1].jf as usize, 10);
        assert_eq!(3 + 1 + filter.insns()[3].jf as usize, 10);
        assert_eq!(5 + 1 + filter.insns()[5].jt as usize, 10);
    }
}
