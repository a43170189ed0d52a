//! Decodes incoming command packets and answers them out of a
//! [`MockWorldHandle`], the way a real brick's VM and system services
//! would.
//!
//! Direct commands are interpreted by walking the bytecode stream for the
//! small opcode subset the cockpit actually emits; an unrecognised opcode
//! ends the walk and whatever landed in the reply buffer so far goes back.
//! System commands cover the file operations (list, upload, download,
//! delete, mkdir) with small monotonically allocated handles.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, warn};

use crate::mock::world::{MockWorld, MockWorldHandle, normalize_path};
use crate::protocol::bytecode::OperandReader;
use crate::protocol::packet::{
    DIRECT_COMMAND_NO_REPLY, DIRECT_COMMAND_REPLY, DIRECT_REPLY, SYSTEM_COMMAND_NO_REPLY,
    SYSTEM_COMMAND_REPLY, SYSTEM_REPLY, SYSTEM_REPLY_ERROR,
};
use crate::protocol::Packet;

/// Answers one raw command packet with raw reply bytes, or nothing for
/// fire-and-forget command types.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn handle(&self, request: &[u8]) -> Option<Vec<u8>>;
}

// Direct opcodes the walk understands.
mod op {
    pub const UI_READ: u8 = 0x81;
    pub const UI_WRITE: u8 = 0x82;
    pub const INFO: u8 = 0x7c;
    pub const SOUND: u8 = 0x94;
    pub const INPUT_DEVICE: u8 = 0x99;
    pub const INPUT_READ_SI: u8 = 0x9a;
    pub const OUTPUT_RESET: u8 = 0xa2;
    pub const OUTPUT_STOP: u8 = 0xa3;
    pub const OUTPUT_SPEED: u8 = 0xa5;
    pub const OUTPUT_START: u8 = 0xa6;
    pub const OUTPUT_GET_COUNT: u8 = 0xb3;
}

/// Subcommand bytes, mock-internal where the firmware value is moot.
pub mod subcode {
    pub const INPUT_SET_TYPEMODE: u8 = 0x01;
    pub const INPUT_GET_TYPEMODE: u8 = 0x05;

    pub const UI_READ_VBATT: u8 = 0x01;
    pub const UI_READ_IBATT: u8 = 0x02;
    pub const UI_READ_LBATT: u8 = 0x12;
    pub const UI_READ_VOLUME: u8 = 0x16;
    pub const UI_READ_SLEEP: u8 = 0x17;
    pub const UI_READ_PRESS: u8 = 0x18;

    pub const UI_WRITE_LED: u8 = 0x1b;
    pub const UI_WRITE_VOLUME: u8 = 0x1c;
    pub const UI_WRITE_SLEEP: u8 = 0x1d;

    pub const INFO_SET_BRICKNAME: u8 = 0x08;
    pub const INFO_GET_BRICKNAME: u8 = 0x0d;

    pub const SOUND_BREAK: u8 = 0x00;
    pub const SOUND_TONE: u8 = 0x01;
    pub const SOUND_PLAY: u8 = 0x02;
    pub const SOUND_REPEAT: u8 = 0x03;
}

// System command opcodes and reply statuses.
pub mod system {
    pub const BEGIN_DOWNLOAD: u8 = 0x92;
    pub const CONTINUE_DOWNLOAD: u8 = 0x93;
    pub const BEGIN_UPLOAD: u8 = 0x94;
    pub const CONTINUE_UPLOAD: u8 = 0x95;
    pub const CLOSE_FILEHANDLE: u8 = 0x98;
    pub const LIST_FILES: u8 = 0x99;
    pub const CONTINUE_LIST_FILES: u8 = 0x9a;
    pub const CREATE_DIR: u8 = 0x9b;
    pub const DELETE_FILE: u8 = 0x9c;

    pub const STATUS_SUCCESS: u8 = 0x00;
    pub const STATUS_UNKNOWN_HANDLE: u8 = 0x01;
    pub const STATUS_END_OF_FILE: u8 = 0x08;
    pub const STATUS_UNKNOWN_ERROR: u8 = 0x0a;
}

enum FileHandle {
    /// Brick-to-host transfer (upload in EV3 terms), including listings.
    Read { data: Vec<u8>, offset: usize },
    /// Host-to-brick transfer; bytes land in the tree once complete or on
    /// close.
    Write {
        path: String,
        expected: usize,
        data: Vec<u8>,
    },
}

#[derive(Default)]
struct FileSession {
    next_handle: u8,
    handles: HashMap<u8, FileHandle>,
}

impl FileSession {
    fn allocate(&mut self, handle: FileHandle) -> u8 {
        let id = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.handles.insert(id, handle);
        id
    }
}

pub struct CommandResponder {
    world: MockWorldHandle,
    files: Mutex<FileSession>,
}

impl CommandResponder {
    pub fn new(world: MockWorldHandle) -> Self {
        Self {
            world,
            files: Mutex::new(FileSession::default()),
        }
    }

    pub fn world(&self) -> &MockWorldHandle {
        &self.world
    }

    /// Interprets a direct-command payload, returning the filled reply
    /// buffer.
    fn run_direct(&self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 2 {
            return Vec::new();
        }
        let global_vars = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        let mut reply = vec![0u8; global_vars];
        let mut reader = OperandReader::new(&payload[2..]);

        self.world.with(|world| {
            while let Some(opcode) = reader.next_byte() {
                let handled = match opcode {
                    op::INPUT_DEVICE => input_device(world, &mut reader, &mut reply),
                    op::INPUT_READ_SI => input_read_si(world, &mut reader, &mut reply),
                    op::OUTPUT_SPEED => output_speed(world, &mut reader),
                    op::OUTPUT_START => output_start(world, &mut reader),
                    op::OUTPUT_STOP => output_stop(world, &mut reader),
                    op::OUTPUT_RESET => output_reset(world, &mut reader),
                    op::OUTPUT_GET_COUNT => output_get_count(world, &mut reader, &mut reply),
                    op::UI_READ => ui_read(world, &mut reader, &mut reply),
                    op::UI_WRITE => ui_write(world, &mut reader),
                    op::INFO => info(world, &mut reader, &mut reply),
                    op::SOUND => sound(&mut reader),
                    other => {
                        debug!("direct walk stops at unknown opcode {other:#04x}");
                        false
                    }
                };
                if !handled {
                    break;
                }
            }
        });
        reply
    }

    /// Handles one system command, returning `(status, reply tail)`.
    fn run_system(&self, payload: &[u8]) -> (u8, Vec<u8>) {
        let Some((&opcode, args)) = payload.split_first() else {
            return (system::STATUS_UNKNOWN_ERROR, Vec::new());
        };
        let mut files = self.files.lock().expect("file session lock poisoned");
        match opcode {
            system::LIST_FILES => {
                let Some((max_bytes, path)) = u16_then_path(args) else {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                let listing = self.world.with(|world| world.fs.list(&path));
                let Some(listing) = listing else {
                    warn!("LIST_FILES on missing path {path}");
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                let data = listing.into_bytes();
                begin_read(&mut files, data, max_bytes as usize)
            }
            system::CONTINUE_LIST_FILES | system::CONTINUE_UPLOAD => {
                let Some((&handle, rest)) = args.split_first() else {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                let max_bytes = match rest {
                    [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]) as usize,
                    _ => return (system::STATUS_UNKNOWN_ERROR, Vec::new()),
                };
                continue_read(&mut files, handle, max_bytes)
            }
            system::BEGIN_UPLOAD => {
                let Some((max_bytes, path)) = u16_then_path(args) else {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                let bytes = self
                    .world
                    .with(|world| world.fs.file_bytes(&path).map(<[u8]>::to_vec));
                let Some(bytes) = bytes else {
                    warn!("BEGIN_UPLOAD on missing file {path}");
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                begin_read(&mut files, bytes, max_bytes as usize)
            }
            system::BEGIN_DOWNLOAD => {
                if args.len() < 4 {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                }
                let expected =
                    u32::from_le_bytes([args[0], args[1], args[2], args[3]]) as usize;
                let Some(path) = c_string_at(args, 4) else {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                let handle = files.allocate(FileHandle::Write {
                    path: normalize_path(&path),
                    expected,
                    data: Vec::with_capacity(expected),
                });
                (system::STATUS_SUCCESS, vec![handle])
            }
            system::CONTINUE_DOWNLOAD => {
                let Some((&handle, chunk)) = args.split_first() else {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                let Some(FileHandle::Write { path, expected, data }) =
                    files.handles.get_mut(&handle)
                else {
                    return (system::STATUS_UNKNOWN_HANDLE, vec![handle]);
                };
                data.extend_from_slice(chunk);
                if data.len() >= *expected {
                    let path = path.clone();
                    let bytes = std::mem::take(data);
                    files.handles.remove(&handle);
                    let stored = self.world.with(|world| world.fs.write_file(&path, bytes));
                    if !stored {
                        return (system::STATUS_UNKNOWN_ERROR, vec![handle]);
                    }
                    return (system::STATUS_END_OF_FILE, vec![handle]);
                }
                (system::STATUS_SUCCESS, vec![handle])
            }
            system::CLOSE_FILEHANDLE => {
                let Some(&handle) = args.first() else {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                match files.handles.remove(&handle) {
                    Some(FileHandle::Write { path, data, .. }) => {
                        // The firmware flushes whatever arrived when the
                        // handle closes early.
                        self.world.with(|world| world.fs.write_file(&path, data));
                        (system::STATUS_SUCCESS, vec![handle])
                    }
                    Some(FileHandle::Read { .. }) => (system::STATUS_SUCCESS, vec![handle]),
                    None => (system::STATUS_UNKNOWN_HANDLE, vec![handle]),
                }
            }
            system::CREATE_DIR => {
                let Some(path) = c_string_at(args, 0) else {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                let created = self.world.with(|world| world.fs.create_dir(&path));
                if created {
                    (system::STATUS_SUCCESS, Vec::new())
                } else {
                    (system::STATUS_UNKNOWN_ERROR, Vec::new())
                }
            }
            system::DELETE_FILE => {
                let Some(path) = c_string_at(args, 0) else {
                    return (system::STATUS_UNKNOWN_ERROR, Vec::new());
                };
                let deleted = self.world.with(|world| world.fs.delete(&path));
                if deleted {
                    (system::STATUS_SUCCESS, Vec::new())
                } else {
                    (system::STATUS_UNKNOWN_ERROR, Vec::new())
                }
            }
            other => {
                warn!("unhandled system opcode {other:#04x}");
                (system::STATUS_UNKNOWN_ERROR, Vec::new())
            }
        }
    }
}

#[async_trait]
impl Responder for CommandResponder {
    async fn handle(&self, request: &[u8]) -> Option<Vec<u8>> {
        let packet = match Packet::decode(request) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("mock responder ignoring undecodable request: {err}");
                return None;
            }
        };
        match packet.packet_type {
            DIRECT_COMMAND_REPLY => {
                let reply = self.run_direct(&packet.payload);
                Packet::new(packet.message_counter, DIRECT_REPLY, reply)
                    .encode()
                    .ok()
            }
            DIRECT_COMMAND_NO_REPLY => {
                self.run_direct(&packet.payload);
                None
            }
            SYSTEM_COMMAND_REPLY => {
                let Some(&opcode) = packet.payload.first() else {
                    return None;
                };
                let (status, tail) = self.run_system(&packet.payload);
                let reply_type = match status {
                    system::STATUS_SUCCESS | system::STATUS_END_OF_FILE => SYSTEM_REPLY,
                    _ => SYSTEM_REPLY_ERROR,
                };
                let mut payload = vec![opcode, status];
                payload.extend_from_slice(&tail);
                Packet::new(packet.message_counter, reply_type, payload)
                    .encode()
                    .ok()
            }
            SYSTEM_COMMAND_NO_REPLY => {
                self.run_system(&packet.payload);
                None
            }
            other => {
                warn!("mock responder ignoring packet type {other:#04x}");
                None
            }
        }
    }
}

fn u16_then_path(args: &[u8]) -> Option<(u16, String)> {
    if args.len() < 2 {
        return None;
    }
    let value = u16::from_le_bytes([args[0], args[1]]);
    let path = c_string_at(args, 2)?;
    Some((value, path))
}

fn c_string_at(args: &[u8], offset: usize) -> Option<String> {
    let slice = args.get(offset..)?;
    let nul = slice.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&slice[..nul]).into_owned())
}

/// Starts a brick-to-host transfer: the first chunk travels in the begin
/// reply together with the total size and the handle.
fn begin_read(files: &mut FileSession, data: Vec<u8>, max_bytes: usize) -> (u8, Vec<u8>) {
    let total = data.len() as u32;
    let first = data.len().min(max_bytes);
    let mut tail = Vec::with_capacity(5 + first);
    tail.extend_from_slice(&total.to_le_bytes());
    if first >= data.len() {
        tail.push(0);
        tail.extend_from_slice(&data);
        (system::STATUS_END_OF_FILE, tail)
    } else {
        let chunk = data[..first].to_vec();
        let handle = files.allocate(FileHandle::Read { data, offset: first });
        tail.push(handle);
        tail.extend_from_slice(&chunk);
        (system::STATUS_SUCCESS, tail)
    }
}

fn continue_read(files: &mut FileSession, handle: u8, max_bytes: usize) -> (u8, Vec<u8>) {
    let Some(FileHandle::Read { data, offset }) = files.handles.get_mut(&handle) else {
        return (system::STATUS_UNKNOWN_HANDLE, vec![handle]);
    };
    let end = (*offset + max_bytes).min(data.len());
    let chunk = data[*offset..end].to_vec();
    *offset = end;
    let finished = *offset >= data.len();
    if finished {
        files.handles.remove(&handle);
    }
    let mut tail = Vec::with_capacity(1 + chunk.len());
    tail.push(handle);
    tail.extend_from_slice(&chunk);
    let status = if finished {
        system::STATUS_END_OF_FILE
    } else {
        system::STATUS_SUCCESS
    };
    (status, tail)
}

fn sensor_index(value: i32) -> Option<usize> {
    usize::try_from(value)
        .ok()
        .filter(|index| *index < crate::mock::world::SENSOR_PORT_COUNT)
}

/// Output-port bit mask (1/2/4/8) to motor indices (A..D).
fn motor_indices(mask: i32) -> Vec<usize> {
    (0..crate::mock::world::MOTOR_PORT_COUNT)
        .filter(|index| mask & (1 << index) != 0)
        .collect()
}

fn write_bytes(reply: &mut [u8], offset: usize, bytes: &[u8]) -> bool {
    let Some(slot) = reply.get_mut(offset..offset + bytes.len()) else {
        warn!("reply buffer write at {offset} out of bounds");
        return false;
    };
    slot.copy_from_slice(bytes);
    true
}

fn input_device(world: &mut MockWorld, reader: &mut OperandReader<'_>, reply: &mut [u8]) -> bool {
    let Some(sub) = reader.next_value() else {
        return false;
    };
    match sub as u8 {
        subcode::INPUT_GET_TYPEMODE => {
            let (Some(_layer), Some(port)) = (reader.next_value(), reader.next_value()) else {
                return false;
            };
            let (Some(gv_type), Some(gv_mode)) = (reader.next_global(), reader.next_global())
            else {
                return false;
            };
            let Some(index) = sensor_index(port) else {
                return false;
            };
            let sensor = &world.sensors[index];
            write_bytes(reply, gv_type as usize, &[sensor.type_code])
                && write_bytes(reply, gv_mode as usize, &[sensor.mode])
        }
        subcode::INPUT_SET_TYPEMODE => {
            let (Some(_layer), Some(port), Some(type_code), Some(mode)) = (
                reader.next_value(),
                reader.next_value(),
                reader.next_value(),
                reader.next_value(),
            ) else {
                return false;
            };
            let Some(index) = sensor_index(port) else {
                return false;
            };
            world.sensors[index].type_code = type_code as u8;
            world.sensors[index].mode = mode as u8;
            true
        }
        other => {
            debug!("unknown INPUT_DEVICE subcommand {other:#04x}");
            false
        }
    }
}

fn input_read_si(world: &mut MockWorld, reader: &mut OperandReader<'_>, reply: &mut [u8]) -> bool {
    let (Some(_layer), Some(port), Some(_type), Some(_mode)) = (
        reader.next_value(),
        reader.next_value(),
        reader.next_value(),
        reader.next_value(),
    ) else {
        return false;
    };
    let Some(gv) = reader.next_global() else {
        return false;
    };
    let Some(index) = sensor_index(port) else {
        return false;
    };
    let value = world.sensor_value(index);
    write_bytes(reply, gv as usize, &value.to_le_bytes())
}

fn output_speed(world: &mut MockWorld, reader: &mut OperandReader<'_>) -> bool {
    let (Some(_layer), Some(mask), Some(speed)) = (
        reader.next_value(),
        reader.next_value(),
        reader.next_value(),
    ) else {
        return false;
    };
    for index in motor_indices(mask) {
        world.motors[index].set_speed(speed);
    }
    true
}

fn output_start(world: &mut MockWorld, reader: &mut OperandReader<'_>) -> bool {
    let (Some(_layer), Some(mask)) = (reader.next_value(), reader.next_value()) else {
        return false;
    };
    for index in motor_indices(mask) {
        world.motors[index].start();
    }
    true
}

fn output_stop(world: &mut MockWorld, reader: &mut OperandReader<'_>) -> bool {
    let (Some(_layer), Some(mask), Some(brake)) = (
        reader.next_value(),
        reader.next_value(),
        reader.next_value(),
    ) else {
        return false;
    };
    for index in motor_indices(mask) {
        world.motors[index].stop(brake != 0);
    }
    true
}

fn output_reset(world: &mut MockWorld, reader: &mut OperandReader<'_>) -> bool {
    let (Some(_layer), Some(mask)) = (reader.next_value(), reader.next_value()) else {
        return false;
    };
    for index in motor_indices(mask) {
        world.motors[index].reset();
    }
    true
}

fn output_get_count(
    world: &mut MockWorld,
    reader: &mut OperandReader<'_>,
    reply: &mut [u8],
) -> bool {
    let (Some(_layer), Some(mask)) = (reader.next_value(), reader.next_value()) else {
        return false;
    };
    let Some(gv) = reader.next_global() else {
        return false;
    };
    let Some(&index) = motor_indices(mask).first() else {
        return false;
    };
    let tacho = world.motors[index].tacho_degrees();
    write_bytes(reply, gv as usize, &tacho.to_le_bytes())
}

fn ui_read(world: &mut MockWorld, reader: &mut OperandReader<'_>, reply: &mut [u8]) -> bool {
    let Some(sub) = reader.next_value() else {
        return false;
    };
    let Some(gv) = reader.next_global() else {
        return false;
    };
    let offset = gv as usize;
    match sub as u8 {
        subcode::UI_READ_VBATT => {
            write_bytes(reply, offset, &world.brick.battery_voltage.to_le_bytes())
        }
        subcode::UI_READ_IBATT => {
            write_bytes(reply, offset, &world.brick.battery_current.to_le_bytes())
        }
        subcode::UI_READ_LBATT => write_bytes(reply, offset, &[world.brick.battery_level()]),
        subcode::UI_READ_VOLUME => write_bytes(reply, offset, &[world.brick.volume()]),
        subcode::UI_READ_SLEEP => {
            write_bytes(reply, offset, &[world.brick.sleep_minutes.min(255) as u8])
        }
        subcode::UI_READ_PRESS => write_bytes(reply, offset, &[world.brick.button_bits]),
        other => {
            debug!("unknown UI_READ subcommand {other:#04x}");
            false
        }
    }
}

fn ui_write(world: &mut MockWorld, reader: &mut OperandReader<'_>) -> bool {
    let Some(sub) = reader.next_value() else {
        return false;
    };
    let Some(value) = reader.next_value() else {
        return false;
    };
    match sub as u8 {
        subcode::UI_WRITE_LED => {
            world.brick.led_pattern = value as u8;
            true
        }
        subcode::UI_WRITE_VOLUME => {
            world.brick.set_volume(value);
            true
        }
        subcode::UI_WRITE_SLEEP => {
            world.brick.sleep_minutes = value.max(0) as u32;
            true
        }
        other => {
            debug!("unknown UI_WRITE subcommand {other:#04x}");
            false
        }
    }
}

fn info(world: &mut MockWorld, reader: &mut OperandReader<'_>, reply: &mut [u8]) -> bool {
    let Some(sub) = reader.next_value() else {
        return false;
    };
    match sub as u8 {
        subcode::INFO_GET_BRICKNAME => {
            let Some(max_length) = reader.next_value() else {
                return false;
            };
            let Some(gv) = reader.next_global() else {
                return false;
            };
            let mut name: Vec<u8> = world.brick.name().as_bytes().to_vec();
            let capacity = usize::try_from(max_length).unwrap_or(0).max(1);
            name.truncate(capacity - 1);
            name.push(0);
            write_bytes(reply, gv as usize, &name)
        }
        subcode::INFO_SET_BRICKNAME => {
            let Some(crate::protocol::bytecode::Operand::Text(name)) = reader.next_operand()
            else {
                return false;
            };
            world.brick.set_name(&name);
            true
        }
        other => {
            debug!("unknown INFO subcommand {other:#04x}");
            false
        }
    }
}

/// Sound is acknowledged and otherwise ignored; operands are consumed so
/// the walk can continue past it.
fn sound(reader: &mut OperandReader<'_>) -> bool {
    let Some(sub) = reader.next_value() else {
        return false;
    };
    match sub as u8 {
        subcode::SOUND_BREAK => true,
        subcode::SOUND_TONE => {
            reader.next_value().is_some()
                && reader.next_value().is_some()
                && reader.next_value().is_some()
        }
        subcode::SOUND_PLAY | subcode::SOUND_REPEAT => {
            reader.next_value().is_some() && reader.next_operand().is_some()
        }
        other => {
            debug!("unknown SOUND subcommand {other:#04x}");
            false
        }
    }
}
