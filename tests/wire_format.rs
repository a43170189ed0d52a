//! Bit-exact wire format checks against literal byte strings.

mod common;

use common::hex_to_bytes;
use ev3_cockpit::protocol::Packet;
use ev3_cockpit::protocol::bytecode::{self, DirectCommand};
use ev3_cockpit::protocol::packet::{
    DIRECT_COMMAND_REPLY, DIRECT_REPLY, SYSTEM_COMMAND_REPLY, SYSTEM_REPLY,
};

#[test]
fn direct_command_frame_2a00() {
    // body_len=5, counter=0x2a, DIRECT_COMMAND_REPLY, payload 10 20
    let bytes = hex_to_bytes("0500 2a00 00 1020");
    let packet = Packet::decode(&bytes).expect("frame decodes");
    assert_eq!(packet.message_counter, 0x2a);
    assert_eq!(packet.packet_type, DIRECT_COMMAND_REPLY);
    assert_eq!(packet.payload, vec![0x10, 0x20]);
    assert_eq!(packet.encode().unwrap(), bytes);
}

#[test]
fn system_probe_frame() {
    let probe = Packet::new(1, SYSTEM_COMMAND_REPLY, vec![0x9d]);
    assert_eq!(probe.encode().unwrap(), hex_to_bytes("0400 0100 01 9d"));
}

#[test]
fn direct_reply_frame() {
    let bytes = hex_to_bytes("0700 0300 02 00000040");
    let packet = Packet::decode(&bytes).unwrap();
    assert_eq!(packet.packet_type, DIRECT_REPLY);
    assert_eq!(bytecode::read_f32le(&packet.payload, 0).unwrap(), 2.0);
}

#[test]
fn system_reply_echoes_opcode_and_status() {
    let bytes = hex_to_bytes("0500 0900 03 9b00");
    let packet = Packet::decode(&bytes).unwrap();
    assert_eq!(packet.packet_type, SYSTEM_REPLY);
    assert_eq!(packet.payload, vec![0x9b, 0x00]);
}

#[test]
fn read_si_direct_command_bytes() {
    // The canonical "read port 0 in SI units into 4 reply bytes" command.
    let mut command = DirectCommand::new(4);
    command
        .push(vec![0x9a])
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::gv0(0).unwrap());
    assert_eq!(command.into_payload(), hex_to_bytes("0400 9a 00 00 00 00 60"));
}

#[test]
fn lcs_string_operand_bytes() {
    let mut command = DirectCommand::new(0);
    command
        .push(vec![0x7c])
        .push(bytecode::lc0(0x08).unwrap())
        .push(bytecode::lcs("EV3"));
    assert_eq!(command.into_payload(), hex_to_bytes("0000 7c 08 84 455633 00"));
}
