use std::io::ErrorKind;

use super::{pipe_pair, unit, WIN_64K};
use crate::tcp::{TcpFlags, TcpPacket, TcpState};

fn rst(seq_no: u32) -> TcpPacket {
    TcpPacket {
        src_port: 1808,
        dst_port: 80,
        seq_no,
        ack_no: 0,
        flags: TcpFlags::RST,
        window: 0,
        urgent_ptr: 0,
        content: Vec::new(),
    }
}

#[test]
fn rst_mid_stream_aborts_connection() {
    let (mut client, mut server) = pipe_pair();
    client.cfg.iss = Some(1000);
    server.cfg.iss = Some(4000);
    client.handshake_pipe(&mut server);

    client.write(b"half").unwrap();
    client.clear_outgoing();

    client.incoming(rst(4001));
    assert_eq!(client.state, TcpState::Closed);
    assert_eq!(client.reset_error(), Some(ErrorKind::ConnectionReset));

    // both directions fail immediately
    assert_eq!(client.write(b"x").unwrap_err().kind(), ErrorKind::ConnectionReset);
    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf), 0);
    assert!(client.rx_closed());

    // nothing is retransmitted for an aborted connection
    client.tick();
    client.assert_outgoing_eq(&[]);
}

#[test]
fn rst_refuses_active_open() {
    let mut test = unit();
    test.connect();
    test.clear_outgoing();

    test.incoming(TcpPacket::rst_for_syn(&TcpPacket::syn(80, 1808, 0, WIN_64K)));
    assert_eq!(test.state, TcpState::Closed);
    assert_eq!(test.reset_error(), Some(ErrorKind::ConnectionReset));
    test.assert_outgoing_eq(&[]);
}

#[test]
fn rst_aborts_teardown_states() {
    let (mut client, mut server) = pipe_pair();
    client.cfg.iss = Some(1000);
    server.cfg.iss = Some(4000);
    client.handshake_pipe(&mut server);

    client.close();
    assert_eq!(client.state, TcpState::FinWait1);
    client.clear_outgoing();

    client.incoming(rst(4001));
    assert_eq!(client.state, TcpState::Closed);
    assert_eq!(client.reset_error(), Some(ErrorKind::ConnectionReset));
}
