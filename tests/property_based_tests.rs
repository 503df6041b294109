//! Property-based tests for decoding, socket correlation and verdicts

use nix::unistd::Pid;
use proptest::prelude::*;
use sockprobe::config::PreferenceThresholds;
use sockprobe::decode::SockAddr;
use sockprobe::event::Origin;
use sockprobe::property::{Property, PropertyKind, PropertyRegistry};
use sockprobe::scenario::{check_preferred, Attempt};
use sockprobe::testcase::TestCase;
use sockprobe::timeline::{NoMemory, RawSyscall, Timeline};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_syscall_name_never_panics(syscall_num in -10i64..600) {
        let name = sockprobe::syscalls::syscall_name(syscall_num);
        prop_assert!(!name.is_empty());
        prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn prop_sockaddr_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        if let Some(addr) = SockAddr::decode(&bytes) {
            let text = addr.to_string();
            prop_assert!(text.starts_with('<'));
            prop_assert!(text.ends_with('>'));
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Open(i32),
    Close(i32, bool),
    Shutdown(i32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (3i32..8).prop_map(Op::Open),
        (3i32..8, any::<bool>()).prop_map(|(fd, ok)| Op::Close(fd, ok)),
        (3i32..8).prop_map(Op::Shutdown),
    ]
}

fn raw(name: &'static str, args: [u64; 6], result: i64, time: f64) -> RawSyscall {
    RawSyscall {
        pid: Pid::from_raw(42),
        origin: Origin::Client,
        name,
        args,
        result,
        time,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_closed_descriptors_never_alias(ops in prop::collection::vec(op(), 1..60)) {
        let pid = Pid::from_raw(42);
        let mut timeline = Timeline::new(false);

        for (step, op) in ops.iter().enumerate() {
            let time = step as f64 * 0.01;
            match *op {
                Op::Open(fd) => {
                    let before = timeline.active_socket(pid, fd);
                    timeline.record_syscall(
                        raw("socket", [libc::AF_INET as u64, libc::SOCK_STREAM as u64, 0, 0, 0, 0], i64::from(fd), time),
                        &NoMemory,
                    );
                    let after = timeline.active_socket(pid, fd);
                    prop_assert!(after.is_some());
                    prop_assert_ne!(before, after);
                }
                Op::Close(fd, ok) => {
                    let before = timeline.active_socket(pid, fd);
                    let result = if ok { 0 } else { -i64::from(libc::EBADF) };
                    timeline.record_syscall(raw("close", [fd as u64, 0, 0, 0, 0, 0], result, time), &NoMemory);
                    if ok {
                        prop_assert_eq!(timeline.active_socket(pid, fd), None);
                    } else {
                        prop_assert_eq!(timeline.active_socket(pid, fd), before);
                    }
                }
                Op::Shutdown(fd) => {
                    timeline.record_syscall(
                        raw("shutdown", [fd as u64, libc::SHUT_RDWR as u64, 0, 0, 0, 0], 0, time),
                        &NoMemory,
                    );
                }
            }
            prop_assert!(timeline.active_count() <= 5);
        }

        for socket in timeline.sockets() {
            let times: Vec<f64> = socket
                .events
                .iter()
                .filter_map(|&id| timeline.event(id))
                .map(|event| event.time)
                .collect();
            prop_assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }

    #[test]
    fn prop_preferred_delay_respects_thresholds(
        attempted in 0.0f64..1.0,
        held in 0.0f64..1.0,
        fallback_start in 0.0f64..1.0,
        fallback_held in prop::option::of(0.0f64..1.0),
    ) {
        let thresholds = PreferenceThresholds::default();
        let preferred = Attempt { attempted, closed: Some(attempted + held) };
        let fallback = Attempt {
            attempted: fallback_start,
            closed: fallback_held.map(|held| fallback_start + held),
        };

        if let Some(delay) = check_preferred(preferred, fallback, &thresholds) {
            prop_assert!(delay >= thresholds.min_delay - 1e-9);
            prop_assert!(attempted <= fallback_start + thresholds.ordering_slack);
            if let Some(fallback_closed) = fallback.closed {
                prop_assert!(attempted + held <= fallback_closed);
            }
        }
    }

    #[test]
    fn prop_any_failure_fails_the_testcase(
        values in prop::collection::vec(any::<bool>(), 4),
        errors in 0usize..3,
    ) {
        let registry = PropertyRegistry::standard();
        let mut testcase = TestCase::new("prop", &registry, None);
        let kinds = [
            PropertyKind::Ip4Listener,
            PropertyKind::Ip6Listener,
            PropertyKind::ConnectionCleanup,
            PropertyKind::ParallelConnect,
        ];
        for (kind, value) in kinds.into_iter().zip(values.iter().copied()) {
            testcase.add_property(Property::new(kind, value));
        }
        testcase.add_property(Property::errors(errors));

        let expected = values[0] && values[1] && errors == 0;
        prop_assert_eq!(testcase.result(), expected);
    }
}
