//! Command tokens understood by a file worker and the pool, plus the
//! callback tags a worker raises while a command runs.
//!
//! Tokens at `0x7ffc` and above belong to the transport; see
//! [`mf_ipc::wire`].

pub const OPEN_FILE: i32 = 1;
pub const CLOSE_FILE: i32 = 2;
pub const SET_PROCESSORS: i32 = 3;
pub const SET_CACHE: i32 = 4;
pub const SET_CACHE_FRAMES: i32 = 5;
pub const PURGE_CACHE: i32 = 6;
pub const SET_CHANNEL: i32 = 7;
pub const SET_LAYER: i32 = 8;
pub const GET_AUDIO_LENGTH: i32 = 9;
pub const GET_VIDEO_LENGTH: i32 = 10;
pub const GET_AUDIO_POSITION: i32 = 11;
pub const GET_VIDEO_POSITION: i32 = 12;
pub const SET_AUDIO_POSITION: i32 = 13;
pub const SET_VIDEO_POSITION: i32 = 14;
pub const READ_SAMPLES: i32 = 15;
pub const READ_FRAME: i32 = 16;
pub const WRITE_SAMPLES: i32 = 17;
pub const WRITE_FRAMES: i32 = 18;
pub const START_AUDIO_THREAD: i32 = 19;
pub const START_VIDEO_THREAD: i32 = 20;
pub const STOP_AUDIO_THREAD: i32 = 21;
pub const STOP_VIDEO_THREAD: i32 = 22;
pub const GET_AUDIO_BUFFER: i32 = 23;
pub const GET_VIDEO_BUFFER: i32 = 24;
pub const WRITE_AUDIO_BUFFER: i32 = 25;
pub const WRITE_VIDEO_BUFFER: i32 = 26;
pub const CAN_COPY_FROM: i32 = 27;
pub const COLORMODEL_SUPPORTED: i32 = 28;
pub const GET_MEMORY_USAGE: i32 = 29;
/// Answers 1 with the encoded index, or 0 when the file has none.
pub const GET_WAVEFORM_INDEX: i32 = 30;

/// Pool: fork a new worker. Answers with its id and pid.
pub const NEW_FILEFORK: i32 = 100;
/// Pool: stop and reap the worker with the given id.
pub const DELETE_FILEFORK: i32 = 101;

// Callback tags.
pub const START_PROGRESS: u32 = 1;
pub const UPDATE_PROGRESS: u32 = 2;
pub const UPDATE_PROGRESS_TITLE: u32 = 3;
/// Answered with one byte, nonzero when the user cancelled.
pub const PROGRESS_CANCELED: u32 = 4;
pub const STOP_PROGRESS: u32 = 5;
/// Answered with the descriptor of a shared scratch frame.
pub const FILE_READ_TEMP: u32 = 6;

/// Name of a command token for logs.
pub fn name(token: i32) -> &'static str {
    match token {
        OPEN_FILE => "OPEN_FILE",
        CLOSE_FILE => "CLOSE_FILE",
        SET_PROCESSORS => "SET_PROCESSORS",
        SET_CACHE => "SET_CACHE",
        SET_CACHE_FRAMES => "SET_CACHE_FRAMES",
        PURGE_CACHE => "PURGE_CACHE",
        SET_CHANNEL => "SET_CHANNEL",
        SET_LAYER => "SET_LAYER",
        GET_AUDIO_LENGTH => "GET_AUDIO_LENGTH",
        GET_VIDEO_LENGTH => "GET_VIDEO_LENGTH",
        GET_AUDIO_POSITION => "GET_AUDIO_POSITION",
        GET_VIDEO_POSITION => "GET_VIDEO_POSITION",
        SET_AUDIO_POSITION => "SET_AUDIO_POSITION",
        SET_VIDEO_POSITION => "SET_VIDEO_POSITION",
        READ_SAMPLES => "READ_SAMPLES",
        READ_FRAME => "READ_FRAME",
        WRITE_SAMPLES => "WRITE_SAMPLES",
        WRITE_FRAMES => "WRITE_FRAMES",
        START_AUDIO_THREAD => "START_AUDIO_THREAD",
        START_VIDEO_THREAD => "START_VIDEO_THREAD",
        STOP_AUDIO_THREAD => "STOP_AUDIO_THREAD",
        STOP_VIDEO_THREAD => "STOP_VIDEO_THREAD",
        GET_AUDIO_BUFFER => "GET_AUDIO_BUFFER",
        GET_VIDEO_BUFFER => "GET_VIDEO_BUFFER",
        WRITE_AUDIO_BUFFER => "WRITE_AUDIO_BUFFER",
        WRITE_VIDEO_BUFFER => "WRITE_VIDEO_BUFFER",
        CAN_COPY_FROM => "CAN_COPY_FROM",
        COLORMODEL_SUPPORTED => "COLORMODEL_SUPPORTED",
        GET_MEMORY_USAGE => "GET_MEMORY_USAGE",
        GET_WAVEFORM_INDEX => "GET_WAVEFORM_INDEX",
        NEW_FILEFORK => "NEW_FILEFORK",
        DELETE_FILEFORK => "DELETE_FILEFORK",
        _ => "UNKNOWN",
    }
}
