//! End-to-end tests over real loopback UDP sockets.

use core::time::Duration;
use std::{net, time::Instant};

use framewire_udp::{ConfigError, Error, MAX_SEND_FRAMES, TransportConfig, UdpZeroCopy};

const WAIT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A transport connected to a plain socket standing in for the device.
fn pair(config: &TransportConfig) -> (UdpZeroCopy, net::UdpSocket) {
    init_logging();

    let peer = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = peer.local_addr().unwrap().port().to_string();

    let transport = UdpZeroCopy::connect("127.0.0.1", &port, config).unwrap();
    peer.connect(transport.local_addr().unwrap()).unwrap();
    peer.set_read_timeout(Some(WAIT)).unwrap();

    (transport, peer)
}

#[test]
fn received_datagram_is_lent_then_recycled() {
    let (transport, peer) = pair(&TransportConfig::new().with_num_recv_frames(4));
    assert_eq!(transport.recv_frames_available(), 4);

    let payload: Vec<u8> = (0..100).collect();
    peer.send(&payload).unwrap();

    let buff = transport.get_recv_buff(WAIT).unwrap().expect("datagram");

    assert_eq!(buff.len(), 100);
    assert_eq!(&*buff, &payload[..]);
    assert_eq!(transport.recv_frames_available(), 3);

    drop(buff);
    assert_eq!(transport.recv_frames_available(), 4);
}

#[test]
fn zero_timeout_without_data_returns_immediately() {
    let (transport, _peer) = pair(&TransportConfig::default());

    let start = Instant::now();
    let res = transport.get_recv_buff(Duration::ZERO).unwrap();

    assert!(res.is_none());
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(transport.recv_frames_available(), transport.frame_count_recv());
}

#[test]
fn receive_timeout_is_honored() {
    let (transport, _peer) = pair(&TransportConfig::default());
    let timeout = Duration::from_millis(100);

    let start = Instant::now();
    assert!(transport.get_recv_buff(timeout).unwrap().is_none());
    let elapsed = start.elapsed();

    assert!(elapsed >= timeout, "{elapsed:?}");
    assert!(elapsed < timeout + Duration::from_secs(1), "{elapsed:?}");
}

#[test]
fn exhausted_pool_times_out_until_a_frame_is_released() {
    let (transport, peer) = pair(&TransportConfig::new().with_num_recv_frames(2));

    for i in 0..3u8 {
        peer.send(&[i; 8]).unwrap();
    }

    let first = transport.get_recv_buff(WAIT).unwrap().unwrap();
    let second = transport.get_recv_buff(WAIT).unwrap().unwrap();
    assert_eq!(transport.recv_frames_available(), 0);

    let timeout = Duration::from_millis(50);
    let start = Instant::now();
    assert!(transport.get_recv_buff(timeout).unwrap().is_none());
    assert!(start.elapsed() >= timeout);

    assert_eq!(first[0], 0);
    assert_eq!(second[0], 1);
    drop(first);

    let third = transport.get_recv_buff(WAIT).unwrap().unwrap();
    assert_eq!(&*third, &[2; 8]);
}

#[test]
fn frame_wait_and_datagram_wait_share_one_timeout() {
    let (transport, peer) = pair(&TransportConfig::new().with_num_recv_frames(1));

    peer.send(b"only").unwrap();
    let held = transport.get_recv_buff(WAIT).unwrap().unwrap();
    assert_eq!(transport.recv_frames_available(), 0);

    let timeout = Duration::from_millis(400);
    let released_after = timeout / 2;

    let (res, elapsed) = std::thread::scope(|s| {
        s.spawn(move || {
            std::thread::sleep(released_after);
            drop(held);
        });

        // the frame frees up halfway, then no datagram ever comes
        let start = Instant::now();
        let res = transport.get_recv_buff(timeout).unwrap().map(|b| b.len());
        (res, start.elapsed())
    });

    assert_eq!(res, None);
    assert!(elapsed >= timeout, "{elapsed:?}");
    assert!(elapsed < timeout + Duration::from_millis(300), "{elapsed:?}");
    assert_eq!(transport.recv_frames_available(), 1);
}

#[test]
fn release_is_idempotent() {
    let (transport, peer) = pair(&TransportConfig::new().with_num_recv_frames(3));
    peer.send(b"once").unwrap();

    let mut buff = transport.get_recv_buff(WAIT).unwrap().unwrap();
    assert_eq!(transport.recv_frames_available(), 2);

    buff.release();
    buff.release();
    assert!(buff.is_empty());
    assert_eq!(transport.recv_frames_available(), 3);

    drop(buff);
    assert_eq!(transport.recv_frames_available(), 3);
}

#[test]
fn oversized_datagrams_are_truncated() {
    let (transport, peer) = pair(&TransportConfig::new().with_recv_frame_size(16));
    peer.send(&[7; 32]).unwrap();

    let buff = transport.get_recv_buff(WAIT).unwrap().unwrap();
    assert_eq!(&*buff, &[7; 16]);
}

#[test]
fn empty_datagrams_are_discarded() {
    let (transport, peer) = pair(&TransportConfig::new().with_num_recv_frames(2));
    peer.send(&[]).unwrap();

    assert!(
        transport
            .get_recv_buff(Duration::from_millis(100))
            .unwrap()
            .is_none()
    );
    assert_eq!(transport.recv_frames_available(), 2);

    peer.send(b"after").unwrap();
    assert_eq!(&*transport.get_recv_buff(WAIT).unwrap().unwrap(), b"after");
}

#[test]
fn committed_datagrams_reach_the_peer_in_order() {
    let (transport, peer) = pair(&TransportConfig::new().with_num_send_frames(4));
    let mut buf = [0; 64];

    for i in 0..8u8 {
        let mut buff = transport.get_send_buff(WAIT).unwrap().unwrap();
        assert_eq!(buff.index(), usize::from(i) % 4);

        buff[..3].copy_from_slice(&[i, i, i]);
        buff.commit(3).unwrap();

        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[i, i, i]);
    }

    assert_eq!(transport.next_send_index(), 0);
}

#[test]
fn flushing_an_idle_ring_returns_at_once() {
    let (transport, peer) = pair(&TransportConfig::new().with_num_send_frames(2));

    assert!(transport.flush(Duration::ZERO).unwrap());

    transport.get_send_buff(WAIT).unwrap().unwrap().commit(0).unwrap();
    let mut buff = transport.get_send_buff(WAIT).unwrap().unwrap();
    buff[0] = 7;
    buff.commit(1).unwrap();

    let start = Instant::now();
    assert!(transport.flush(WAIT).unwrap());
    assert!(start.elapsed() < WAIT);

    let mut buf = [0; 8];
    assert_eq!(peer.recv(&mut buf).unwrap(), 1);
    assert_eq!(buf[0], 7);
}

#[test]
fn uncommitted_send_buffers_send_nothing() {
    let (transport, peer) = pair(&TransportConfig::new().with_num_send_frames(2));
    peer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();

    let mut buff = transport.get_send_buff(WAIT).unwrap().unwrap();
    buff[..4].copy_from_slice(b"lost");
    drop(buff);

    transport.get_send_buff(WAIT).unwrap().unwrap().commit(0).unwrap();

    // both slots are ready again
    assert!(transport.get_send_buff(Duration::ZERO).unwrap().is_some());
    assert!(peer.recv(&mut [0; 16]).is_err());
}

#[test]
fn busy_send_ring_times_out_without_advancing() {
    let (transport, _peer) = pair(&TransportConfig::new().with_num_send_frames(2));

    let a = transport.get_send_buff(WAIT).unwrap().unwrap();
    let b = transport.get_send_buff(WAIT).unwrap().unwrap();
    assert_eq!((a.index(), b.index()), (0, 1));

    let timeout = Duration::from_millis(50);
    let start = Instant::now();
    assert!(transport.get_send_buff(timeout).unwrap().is_none());
    assert!(start.elapsed() >= timeout);
    assert_eq!(transport.next_send_index(), 0);

    a.commit(1).unwrap();
    b.commit(1).unwrap();

    let c = transport.get_send_buff(WAIT).unwrap().unwrap();
    assert_eq!(c.index(), 0);
}

#[test]
fn too_many_send_frames_fail_before_resolution() {
    init_logging();

    let config = TransportConfig::new().with_num_send_frames(MAX_SEND_FRAMES + 1);
    let err = UdpZeroCopy::connect("unresolvable.invalid", "49152", &config).unwrap_err();

    assert!(matches!(
        err,
        Error::Config(ConfigError::TooManySendFrames {
            requested: 65,
            max: 64,
        })
    ));
}

#[test]
fn transports_are_built_from_device_hints() {
    let config = TransportConfig::from_hints([
        ("recv_frame_size", "256"),
        ("num_recv_frames", "8"),
        ("send_frame_size", "128"),
        ("num_send_frames", "4"),
        ("recv_buff_size", "65536"),
    ])
    .unwrap();

    let (transport, _peer) = pair(&config);

    assert_eq!(transport.frame_size_recv(), 256);
    assert_eq!(transport.frame_count_recv(), 8);
    assert_eq!(transport.frame_size_send(), 128);
    assert_eq!(transport.frame_count_send(), 4);
    assert_eq!(transport.recv_frames_available(), 8);
}
