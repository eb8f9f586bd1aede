//! `tc` command plans that realize per-peer link parameters on one
//! interface.
//!
//! The plan installs a root `htb` qdisc, then for every shaped peer an
//! `htb` class carrying the bandwidth cap, a `netem` leaf carrying delay,
//! jitter and loss, and a `u32` filter steering packets for that peer's
//! address into the class. Traffic to unlisted destinations bypasses the
//! shaping entirely.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::topology::LinkParams;

/// Rate given to classes of peers without a bandwidth cap.
const UNCAPPED_RATE_KBIT: u64 = 10_000_000;

/// First class minor id; ids are rendered in hex as `tc` expects.
const FIRST_CLASS: usize = 0x10;

/// Approximate packet size used to convert a BDP into a queue limit.
const MTU_BYTES: u64 = 1400;

/// Lower bound of the auto-computed netem queue limit, in packets.
const MIN_LIMIT: u64 = 20;

/// Command line that removes any root qdisc from `interface`.
///
/// Fails on the remote side when nothing is installed, so callers treat
/// its outcome as best effort.
pub fn reset(interface: &str) -> Vec<String> {
    tc(&["qdisc", "del", "dev", interface, "root"])
}

/// Builds the command lines shaping traffic from `interface` to each peer.
///
/// Unshaped peers are skipped; an empty plan is returned when no peer needs
/// shaping.
pub fn plan(interface: &str, peers: &[(Ipv4Addr, LinkParams)]) -> Vec<Vec<String>> {
    let shaped: Vec<_> = peers.iter().filter(|(_, p)| !p.is_unshaped()).collect();
    if shaped.is_empty() {
        return Vec::new();
    }

    let mut commands = Vec::with_capacity(1 + shaped.len() * 3);
    commands.push(tc(&["qdisc", "add", "dev", interface, "root", "handle", "1:", "htb"]));

    for (slot, (address, params)) in shaped.into_iter().enumerate() {
        let minor = format!("{:x}", FIRST_CLASS + slot);
        let class_id = format!("1:{minor}");
        let rate = format!("{}kbit", params.rate_kbit.unwrap_or(UNCAPPED_RATE_KBIT));

        commands.push(tc(&[
            "class", "add", "dev", interface, "parent", "1:", "classid", &class_id, "htb", "rate",
            &rate,
        ]));

        let mut netem = tc(&[
            "qdisc",
            "add",
            "dev",
            interface,
            "parent",
            &class_id,
            "handle",
            &format!("{minor}:"),
            "netem",
        ]);
        if let Some(limit) = queue_limit(params) {
            netem.push("limit".into());
            netem.push(limit.to_string());
        }
        append_netem_params(params, &mut netem);
        commands.push(netem);

        commands.push(tc(&[
            "filter",
            "add",
            "dev",
            interface,
            "protocol",
            "ip",
            "parent",
            "1:",
            "prio",
            "1",
            "u32",
            "match",
            "ip",
            "dst",
            &format!("{address}/32"),
            "flowid",
            &class_id,
        ]));
    }

    commands
}

/// Finite netem queue for capped links: twice the bandwidth-delay product,
/// so excess packets are dropped instead of queued forever.
fn queue_limit(params: &LinkParams) -> Option<u64> {
    let rate = params.rate_kbit?;
    let delay_ms = params.latency.as_millis().max(20) as u64;
    let rtt_ms = delay_ms * 2;
    let bdp_bytes = rate * 1000 / 8 * rtt_ms / 1000;
    Some((bdp_bytes / MTU_BYTES * 2).max(MIN_LIMIT))
}

fn append_netem_params(params: &LinkParams, args: &mut Vec<String>) {
    if !params.latency.is_zero() || !params.jitter.is_zero() {
        args.push("delay".into());
        args.push(duration_arg(params.latency));
        if !params.jitter.is_zero() {
            args.push(duration_arg(params.jitter));
        }
    }

    if let Some(loss) = params.loss_percent {
        args.push("loss".into());
        args.push(format!("{loss}%"));
    }
}

fn duration_arg(value: Duration) -> String {
    let micros = value.as_micros();
    if micros % 1000 == 0 {
        format!("{}ms", micros / 1000)
    } else {
        format!("{micros}us")
    }
}

fn tc(args: &[&str]) -> Vec<String> {
    std::iter::once("tc")
        .chain(args.iter().copied())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency(ms: u64) -> LinkParams {
        LinkParams {
            latency: Duration::from_millis(ms),
            ..Default::default()
        }
    }

    #[test]
    fn empty_plan_without_shaped_peers() {
        let peers = [(Ipv4Addr::new(10, 0, 0, 2), LinkParams::default())];
        assert!(plan("eth0", &peers).is_empty());
    }

    #[test]
    fn plan_shapes_each_peer_in_its_own_class() {
        let peers = [
            (Ipv4Addr::new(10, 0, 0, 2), latency(25)),
            (Ipv4Addr::new(10, 0, 0, 3), latency(25)),
        ];
        let commands = plan("eth0", &peers);

        assert_eq!(commands.len(), 7);
        assert_eq!(
            commands[0].join(" "),
            "tc qdisc add dev eth0 root handle 1: htb"
        );
        assert_eq!(
            commands[1].join(" "),
            "tc class add dev eth0 parent 1: classid 1:10 htb rate 10000000kbit"
        );
        assert_eq!(
            commands[2].join(" "),
            "tc qdisc add dev eth0 parent 1:10 handle 10: netem delay 25ms"
        );
        assert_eq!(
            commands[3].join(" "),
            "tc filter add dev eth0 protocol ip parent 1: prio 1 u32 match ip dst 10.0.0.2/32 flowid 1:10"
        );
        assert!(commands[6].join(" ").ends_with("dst 10.0.0.3/32 flowid 1:11"));
    }

    #[test]
    fn capped_link_gets_rate_and_finite_queue() {
        let params = LinkParams {
            latency: Duration::from_millis(50),
            jitter: Duration::from_micros(1500),
            loss_percent: Some(0.5),
            rate_kbit: Some(5000),
        };
        let commands = plan("eth0", &[(Ipv4Addr::new(10, 0, 0, 9), params)]);

        assert!(commands[1].join(" ").ends_with("htb rate 5000kbit"));
        // 5 Mbit/s over a 100 ms RTT is 62500 bytes, 44 packets, doubled.
        assert_eq!(
            commands[2].join(" "),
            "tc qdisc add dev eth0 parent 1:10 handle 10: netem limit 88 delay 50ms 1500us loss 0.5%"
        );
    }

    #[test]
    fn reset_removes_root_qdisc() {
        assert_eq!(reset("eth0").join(" "), "tc qdisc del dev eth0 root");
    }
}
