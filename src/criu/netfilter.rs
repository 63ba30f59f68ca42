//! Firewall rules keeping restored TCP connections quiet until their
//! owners are running again.
//!
//! Packets sent by the repair socket itself carry [`SOCCR_MARK`] and pass;
//! everything else on a locked connection is dropped. iptables rules are
//! run through the `iptables`/`ip6tables` binaries, nftables rules go over
//! netlink in a single batch.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;

use rustables::expr::{Cmp, CmpOp, Meta, MetaType, Register};
use rustables::{Batch, Chain, Hook, HookClass, MsgType, Protocol, ProtocolFamily, Rule, Table};

use crate::criu::inventory::is_valid_run_id;
use crate::criu::options::NetworkLockMethod;
use crate::criu::sk_tcp::{addr4, TcpRepairSock};
use crate::criu::sockets::InetSkInfo;
use crate::error::{CrError, Result};

pub const SOCCR_MARK: u32 = 0xC114;

const CRIU_TABLE_PREFIX: &str = "CRIU-";

#[inline]
pub fn ipv6_addr_mapped(addr: &[u32]) -> bool {
    addr[2] == 0x0000ffff_u32.to_be()
}

/// A connection endpoint pair as the rules see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAddrs {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

fn v4_addr(a: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(a.to_ne_bytes()))
}

fn v6_addr(a: &[u32; 4]) -> IpAddr {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(a.iter()) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    IpAddr::V6(Ipv6Addr::from(bytes))
}

impl ConnAddrs {
    pub fn new(
        family: u32,
        ino: u32,
        src_addr: &[u32; 4],
        src_port: u16,
        dst_addr: &[u32; 4],
        dst_port: u16,
    ) -> Result<Self> {
        let family = family as i32;

        // v4-mapped peers are locked as plain v4
        if family == libc::AF_INET || (family == libc::AF_INET6 && ipv6_addr_mapped(dst_addr)) {
            let idx = if family == libc::AF_INET { 0 } else { 3 };
            return Ok(Self {
                src: v4_addr(src_addr[idx]),
                src_port,
                dst: v4_addr(dst_addr[idx]),
                dst_port,
            });
        }

        if family == libc::AF_INET6 {
            return Ok(Self {
                src: v6_addr(src_addr),
                src_port,
                dst: v6_addr(dst_addr),
                dst_port,
            });
        }

        Err(CrError::Netfilter(format!("Unknown socket family {} for {:#x}", family, ino)))
    }

    pub fn from_repair(sk: &TcpRepairSock) -> Result<Self> {
        Self::new(sk.family, sk.ino, &sk.src_addr, sk.src_port, &sk.dst_addr, sk.dst_port)
    }

    pub fn from_inet(sk: &InetSkInfo) -> Result<Self> {
        Self::new(
            sk.ie.family,
            sk.ie.ino,
            &addr4(&sk.ie.src_addr),
            sk.ie.src_port as u16,
            &addr4(&sk.ie.dst_addr),
            sk.ie.dst_port as u16,
        )
    }

    pub fn is_ipv6(&self) -> bool {
        self.dst.is_ipv6()
    }

    /// Peer and local ends as seen by a packet of one direction:
    /// `(saddr, sport, daddr, dport)`.
    fn direction(&self, input: bool) -> (IpAddr, u16, IpAddr, u16) {
        if input {
            (self.dst, self.dst_port, self.src, self.src_port)
        } else {
            (self.src, self.src_port, self.dst, self.dst_port)
        }
    }
}

/// Command line of one direction of an iptables connection lock.
pub fn iptables_connection_rule(c: &ConnAddrs, input: bool, lock: bool) -> Vec<String> {
    let cmd = if c.is_ipv6() { "ip6tables" } else { "iptables" };
    let action = if lock { "-I" } else { "-D" };
    let chain = if input { "INPUT" } else { "OUTPUT" };
    let (sip, sport, dip, dport) = c.direction(input);
    let (mark, sip, sport, dip, dport) = (
        SOCCR_MARK.to_string(),
        sip.to_string(),
        sport.to_string(),
        dip.to_string(),
        dport.to_string(),
    );

    let argv: [&str; 23] = [
        cmd, "-w", "-t", "filter", action, chain, "--protocol", "tcp", "-m", "mark", "!", "--mark", &mark,
        "--source", &sip, "--sport", &sport, "--destination", &dip, "--dport", &dport, "-j",
        "DROP",
    ];
    argv.iter().map(|s| s.to_string()).collect()
}

fn run_cmd(argv: &[String]) -> Result<()> {
    let (prog, args) = argv
        .split_first()
        .ok_or_else(|| CrError::Netfilter("empty rule command".into()))?;

    log::debug!("netfilter: {}", argv.join(" "));

    let status = Command::new(prog)
        .args(args)
        .status()
        .map_err(|e| CrError::Netfilter(format!("Can't run {}: {}", prog, e)))?;

    if !status.success() {
        return Err(CrError::Netfilter(format!("`{}` failed: {}", argv.join(" "), status)));
    }
    Ok(())
}

/// Runs `rules` in order. When one fails, the undo commands of those
/// already applied are run in reverse order and the error is returned.
fn apply_rules(rules: &[(Vec<String>, Vec<String>)]) -> Result<()> {
    for (i, (rule, _)) in rules.iter().enumerate() {
        if let Err(e) = run_cmd(rule) {
            for (_, undo) in rules[..i].iter().rev() {
                if let Err(ue) = run_cmd(undo) {
                    log::warn!("netfilter rollback: {}", ue);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// iptables lock commands, each paired with the one undoing it.
pub fn iptables_lock_rules(conns: &[ConnAddrs]) -> Vec<(Vec<String>, Vec<String>)> {
    conns
        .iter()
        .flat_map(|c| {
            [true, false].map(|input| {
                (
                    iptables_connection_rule(c, input, true),
                    iptables_connection_rule(c, input, false),
                )
            })
        })
        .collect()
}

fn nft_err(e: impl std::fmt::Display) -> CrError {
    CrError::Netfilter(format!("nftables: {}", e))
}

/// Name of the lock table of one restore. The id ends up in a netlink
/// attribute and in log lines, so only `[A-Za-z0-9-]` is accepted.
pub fn nftables_table_name(id: &str) -> Result<String> {
    if !is_valid_run_id(id) {
        return Err(CrError::Netfilter(format!("bad nftables table id {:?}", id)));
    }
    Ok(format!("{}{}", CRIU_TABLE_PREFIX, id))
}

fn nft_table(name: &str) -> Table {
    Table::new(ProtocolFamily::Inet).with_name(name)
}

fn nft_chain(table: &Table, name: &str, class: HookClass) -> Chain {
    Chain::new(table).with_name(name).with_hook(Hook::new(class, 0))
}

fn nft_mark_accept_rule(chain: &Chain) -> Result<Rule> {
    let meta = Meta::default().with_key(MetaType::Mark).with_dreg(Register::Reg1);
    let cmp = Cmp::new(CmpOp::Eq, SOCCR_MARK.to_ne_bytes().to_vec());

    Ok(Rule::new(chain).map_err(nft_err)?.with_expr(meta).with_expr(cmp).accept())
}

fn nft_connection_rule(chain: &Chain, c: &ConnAddrs, input: bool) -> Result<Rule> {
    let (sip, sport, dip, dport) = c.direction(input);

    Ok(Rule::new(chain)
        .map_err(nft_err)?
        .saddr(sip)
        .daddr(dip)
        .sport(sport, Protocol::TCP)
        .dport(dport, Protocol::TCP)
        .drop())
}

/// Everything the nftables lock adds: the table, its input and output
/// chains, then the mark bypass and the per-connection drops of each chain.
pub struct NftLock {
    pub table: Table,
    pub chains: [Chain; 2],
    pub rules: Vec<Rule>,
}

impl NftLock {
    pub fn build(table_id: &str, conns: &[ConnAddrs]) -> Result<Self> {
        let table = nft_table(&nftables_table_name(table_id)?);
        let input = nft_chain(&table, "input", HookClass::In);
        let output = nft_chain(&table, "output", HookClass::Out);

        let mut rules = vec![nft_mark_accept_rule(&input)?, nft_mark_accept_rule(&output)?];
        for c in conns {
            rules.push(nft_connection_rule(&input, c, true)?);
            rules.push(nft_connection_rule(&output, c, false)?);
        }

        Ok(Self {
            table,
            chains: [input, output],
            rules,
        })
    }

    /// Sends the whole lock as one transaction; on error nothing is left.
    fn send(&self) -> Result<()> {
        let mut batch = Batch::new();
        batch.add(&self.table, MsgType::Add);
        for chain in &self.chains {
            batch.add(chain, MsgType::Add);
        }
        for rule in &self.rules {
            batch.add(rule, MsgType::Add);
        }
        batch.send().map_err(nft_err)
    }
}

fn nftables_unlock(table_id: &str) -> Result<()> {
    let table = nft_table(&nftables_table_name(table_id)?);

    let mut batch = Batch::new();
    batch.add(&table, MsgType::Del);
    batch.send().map_err(nft_err)
}

pub fn network_lock(method: NetworkLockMethod, conns: &[ConnAddrs], table_id: &str) -> Result<()> {
    if method == NetworkLockMethod::Skip {
        log::info!("Network lock skipped");
        return Ok(());
    }

    log::info!("Locking network ({:?}, {} connections)", method, conns.len());
    match method {
        NetworkLockMethod::Iptables => apply_rules(&iptables_lock_rules(conns)),
        NetworkLockMethod::Nftables => NftLock::build(table_id, conns)?.send(),
        NetworkLockMethod::Skip => Ok(()),
    }
}

/// Drops the lock rules. Every rule is tried; the first error is returned.
pub fn network_unlock(method: NetworkLockMethod, conns: &[ConnAddrs], table_id: &str) -> Result<()> {
    log::info!("Unlocking network ({:?})", method);

    match method {
        NetworkLockMethod::Skip => Ok(()),
        NetworkLockMethod::Nftables => nftables_unlock(table_id),
        NetworkLockMethod::Iptables => {
            let mut ret = Ok(());
            for (_, undo) in iptables_lock_rules(conns) {
                if let Err(e) = run_cmd(&undo) {
                    log::error!("{}", e);
                    if ret.is_ok() {
                        ret = Err(e);
                    }
                }
            }
            ret
        }
    }
}
