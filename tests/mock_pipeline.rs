//! The full offline pipeline: command client over the mock transport and
//! responder, exercising sensors, motors, brick settings and the file
//! commands the way the cockpit issues them.

mod common;

use std::sync::Arc;

use ev3_cockpit::mock::{CommandResponder, MockWorldHandle};
use ev3_cockpit::mock::responder::{Responder, subcode, system};
use ev3_cockpit::protocol::bytecode::{self, DirectCommand};
use ev3_cockpit::protocol::packet::{
    DIRECT_COMMAND_NO_REPLY, DIRECT_COMMAND_REPLY, DIRECT_REPLY, SYSTEM_COMMAND_REPLY,
    SYSTEM_REPLY,
};
use ev3_cockpit::scheduler::{CommandClient, CommandRequest};
use ev3_cockpit::transport::MockTransport;

struct Rig {
    client: CommandClient,
    world: MockWorldHandle,
}

async fn rig(seed: u64) -> Rig {
    let world = MockWorldHandle::new(seed);
    let responder = Arc::new(CommandResponder::new(world.clone()));
    let client = CommandClient::new(Box::new(MockTransport::new(responder)));
    client.open().await.expect("mock transport opens");
    Rig { client, world }
}

fn direct(id: &str, payload: Vec<u8>) -> CommandRequest {
    CommandRequest::new(id, DIRECT_COMMAND_REPLY, payload)
}

fn system_cmd(id: &str, payload: Vec<u8>) -> CommandRequest {
    CommandRequest::new(id, SYSTEM_COMMAND_REPLY, payload)
}

#[tokio::test]
async fn sensor_typemode_and_si_read() {
    let rig = rig(1).await;

    // GET_TYPEMODE of port 0 (touch sensor) into two reply bytes.
    let mut command = DirectCommand::new(2);
    command
        .push(vec![0x99])
        .push(bytecode::lc0(subcode::INPUT_GET_TYPEMODE as i32).unwrap())
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::gv0(0).unwrap())
        .push(bytecode::gv0(1).unwrap());
    let result = rig
        .client
        .send(direct("typemode", command.into_payload()))
        .await
        .unwrap();
    let reply = result.reply.unwrap();
    assert_eq!(reply.packet_type, DIRECT_REPLY);
    assert_eq!(reply.payload, vec![16, 0]); // touch sensor, mode 0

    // READ_SI of port 1, the constant colour sensor at 3.0.
    let mut command = DirectCommand::new(4);
    command
        .push(vec![0x9a])
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(1).unwrap())
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::gv0(0).unwrap());
    let result = rig
        .client
        .send(direct("read-si", command.into_payload()))
        .await
        .unwrap();
    let payload = result.reply.unwrap().payload;
    assert_eq!(bytecode::read_f32le(&payload, 0).unwrap(), 3.0);
}

#[tokio::test]
async fn motor_speed_start_tick_and_count() {
    let rig = rig(1).await;

    // Speed 50 on port A, then start, in one command chain, no reply.
    let mut command = DirectCommand::new(0);
    command
        .push(vec![0xa5])
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(1).unwrap())
        .push(bytecode::lc1(50))
        .push(vec![0xa6])
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(1).unwrap());
    let result = rig
        .client
        .send(CommandRequest::new(
            "spin",
            DIRECT_COMMAND_NO_REPLY,
            command.into_payload(),
        ))
        .await
        .unwrap();
    assert!(result.reply.is_none());

    rig.world.tick(1000);

    let mut command = DirectCommand::new(4);
    command
        .push(vec![0xb3])
        .push(bytecode::lc0(0).unwrap())
        .push(bytecode::lc0(1).unwrap())
        .push(bytecode::gv0(0).unwrap());
    let result = rig
        .client
        .send(direct("count", command.into_payload()))
        .await
        .unwrap();
    let payload = result.reply.unwrap().payload;
    assert_eq!(bytecode::read_u32le(&payload, 0).unwrap() as i32, 500);
}

#[tokio::test]
async fn brick_name_round_trip_clamps_to_twelve() {
    let rig = rig(1).await;

    let mut command = DirectCommand::new(0);
    command
        .push(vec![0x7c])
        .push(bytecode::lc0(subcode::INFO_SET_BRICKNAME as i32).unwrap())
        .push(bytecode::lcs("Brickzilla9000"));
    rig.client
        .send(direct("set-name", command.into_payload()))
        .await
        .unwrap();

    let mut command = DirectCommand::new(13);
    command
        .push(vec![0x7c])
        .push(bytecode::lc0(subcode::INFO_GET_BRICKNAME as i32).unwrap())
        .push(bytecode::lc1(13))
        .push(bytecode::gv0(0).unwrap());
    let result = rig
        .client
        .send(direct("get-name", command.into_payload()))
        .await
        .unwrap();
    let payload = result.reply.unwrap().payload;
    let nul = payload.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&payload[..nul], b"Brickzilla90");
}

#[tokio::test]
async fn battery_voltage_reads_as_float() {
    let rig = rig(1).await;
    let mut command = DirectCommand::new(4);
    command
        .push(vec![0x81])
        .push(bytecode::lc0(subcode::UI_READ_VBATT as i32).unwrap())
        .push(bytecode::gv0(0).unwrap());
    let result = rig
        .client
        .send(direct("vbatt", command.into_payload()))
        .await
        .unwrap();
    let payload = result.reply.unwrap().payload;
    let volts = bytecode::read_f32le(&payload, 0).unwrap();
    assert!((volts - 7.9).abs() < 0.001);
}

#[tokio::test]
async fn unknown_opcode_ends_the_walk_with_partial_reply() {
    let rig = rig(1).await;
    let mut command = DirectCommand::new(4);
    command
        .push(vec![0x81])
        .push(bytecode::lc0(subcode::UI_READ_LBATT as i32).unwrap())
        .push(bytecode::gv0(0).unwrap())
        .push(vec![0xee]) // not an opcode the mock knows
        .push(bytecode::gv0(1).unwrap());
    let result = rig
        .client
        .send(direct("partial", command.into_payload()))
        .await
        .unwrap();
    // The first instruction landed, the rest of the buffer stays zero.
    let payload = result.reply.unwrap().payload;
    assert!(payload[0] > 0);
    assert_eq!(&payload[1..], &[0, 0, 0]);
}

#[tokio::test]
async fn file_download_upload_list_delete_round_trip() {
    let rig = rig(1).await;
    let path = "../prjs/test/app.rbf";
    let contents = b"EV3 program bytes".to_vec();

    // BEGIN_DOWNLOAD announces the size and path, CONTINUE_DOWNLOAD
    // carries the data.
    let mut payload = vec![system::BEGIN_DOWNLOAD];
    payload.extend_from_slice(&(contents.len() as u32).to_le_bytes());
    payload.extend_from_slice(&bytecode::c_string(path));
    let result = rig.client.send(system_cmd("begin-dl", payload)).await.unwrap();
    let reply = result.reply.unwrap();
    assert_eq!(reply.packet_type, SYSTEM_REPLY);
    assert_eq!(reply.payload[0], system::BEGIN_DOWNLOAD);
    assert_eq!(reply.payload[1], system::STATUS_SUCCESS);
    let handle = reply.payload[2];

    let mut payload = vec![system::CONTINUE_DOWNLOAD, handle];
    payload.extend_from_slice(&contents);
    let result = rig.client.send(system_cmd("cont-dl", payload)).await.unwrap();
    let reply = result.reply.unwrap();
    assert_eq!(reply.payload[1], system::STATUS_END_OF_FILE);

    // The file is now in the world, path normalised.
    let stored = rig
        .world
        .with(|world| world.fs.file_bytes("/../prjs/test/app.rbf").map(<[u8]>::to_vec));
    assert_eq!(stored, Some(contents.clone()));

    // BEGIN_UPLOAD reads it back in one go.
    let mut payload = vec![system::BEGIN_UPLOAD];
    payload.extend_from_slice(&1024u16.to_le_bytes());
    payload.extend_from_slice(&bytecode::c_string(path));
    let result = rig.client.send(system_cmd("begin-ul", payload)).await.unwrap();
    let reply = result.reply.unwrap();
    assert_eq!(reply.payload[1], system::STATUS_END_OF_FILE);
    let size = bytecode::read_u32le(&reply.payload, 2).unwrap() as usize;
    assert_eq!(size, contents.len());
    assert_eq!(&reply.payload[7..], contents.as_slice());

    // LIST_FILES shows an md5 + hex size + name line.
    let mut payload = vec![system::LIST_FILES];
    payload.extend_from_slice(&1024u16.to_le_bytes());
    payload.extend_from_slice(&bytecode::c_string("../prjs/test"));
    let result = rig.client.send(system_cmd("list", payload)).await.unwrap();
    let reply = result.reply.unwrap();
    let listing = String::from_utf8_lossy(&reply.payload[7..]).into_owned();
    assert!(listing.contains(" app.rbf\n"), "{listing:?}");
    assert!(listing.contains(&format!(" {:08X} ", contents.len())), "{listing:?}");

    // DELETE_FILE removes it; a second delete reports the error family.
    let mut payload = vec![system::DELETE_FILE];
    payload.extend_from_slice(&bytecode::c_string(path));
    let result = rig.client.send(system_cmd("rm", payload.clone())).await.unwrap();
    assert_eq!(result.reply.unwrap().payload[1], system::STATUS_SUCCESS);
    let result = rig.client.send(system_cmd("rm-again", payload)).await.unwrap();
    let reply = result.reply.unwrap();
    assert_eq!(reply.packet_type, ev3_cockpit::protocol::packet::SYSTEM_REPLY_ERROR);
}

#[tokio::test]
async fn chunked_upload_walks_the_handle() {
    let rig = rig(1).await;
    rig.world.with(|world| {
        world.fs.write_file("/data/big.bin", (0u8..=99).collect());
    });

    let mut payload = vec![system::BEGIN_UPLOAD];
    payload.extend_from_slice(&40u16.to_le_bytes());
    payload.extend_from_slice(&bytecode::c_string("/data/big.bin"));
    let result = rig.client.send(system_cmd("begin", payload)).await.unwrap();
    let reply = result.reply.unwrap();
    assert_eq!(reply.payload[1], system::STATUS_SUCCESS);
    assert_eq!(bytecode::read_u32le(&reply.payload, 2).unwrap(), 100);
    let handle = reply.payload[6];
    let mut collected = reply.payload[7..].to_vec();

    loop {
        let mut payload = vec![system::CONTINUE_UPLOAD, handle];
        payload.extend_from_slice(&40u16.to_le_bytes());
        let result = rig.client.send(system_cmd("cont", payload)).await.unwrap();
        let reply = result.reply.unwrap();
        collected.extend_from_slice(&reply.payload[3..]);
        if reply.payload[1] == system::STATUS_END_OF_FILE {
            break;
        }
        assert_eq!(reply.payload[1], system::STATUS_SUCCESS);
    }
    let expected: Vec<u8> = (0u8..=99).collect();
    assert_eq!(collected, expected);
}

#[tokio::test]
async fn create_dir_and_reset_rebuild_the_world() {
    let rig = rig(77).await;
    let mut payload = vec![system::CREATE_DIR];
    payload.extend_from_slice(&bytecode::c_string("/home/root/lms2012/prjs/new"));
    let result = rig.client.send(system_cmd("mkdir", payload)).await.unwrap();
    assert_eq!(result.reply.unwrap().payload[1], system::STATUS_SUCCESS);
    assert!(rig
        .world
        .with(|world| world.fs.node("/home/root/lms2012/prjs/new").is_some()));

    rig.world.reset();
    assert!(rig
        .world
        .with(|world| world.fs.node("/home/root/lms2012/prjs/new").is_none()));
}

#[tokio::test]
async fn no_reply_system_command_still_mutates() {
    let world = MockWorldHandle::new(3);
    let responder = CommandResponder::new(world.clone());
    let mut payload = vec![system::CREATE_DIR];
    payload.extend_from_slice(&bytecode::c_string("/made/quietly"));
    let request = ev3_cockpit::protocol::Packet::new(
        11,
        ev3_cockpit::protocol::packet::SYSTEM_COMMAND_NO_REPLY,
        payload,
    )
    .encode()
    .unwrap();
    assert!(responder.handle(&request).await.is_none());
    assert!(world.with(|w| w.fs.node("/made/quietly").is_some()));
}

#[tokio::test]
async fn send_after_close_reports_not_open() {
    let rig = rig(1).await;
    rig.client.close().await.unwrap();
    let mut command = DirectCommand::new(0);
    command.push(vec![0x94]).push(bytecode::lc0(0).unwrap());
    let err = rig
        .client
        .send(CommandRequest::new(
            "late",
            DIRECT_COMMAND_NO_REPLY,
            command.into_payload(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ev3_cockpit::TransportError::NotOpen));
}
