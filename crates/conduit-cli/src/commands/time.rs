// crates/conduit-cli/src/commands/time.rs
//
// `conduit time`: follow the `time.stream` procedure over the daemon's raw
// duplex binding. Ctrl-c sends a cancel frame and waits for the `aborted`
// envelope.

use bytes::Bytes;
use clap::{Args, ValueEnum};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use conduit_core::{ResponseBody, ResponseEnvelope};
use conduit_rpc::binding::framing::{FrameCodec, Framing, DEFAULT_MAX_FRAME_LENGTH};

use crate::output::{format_json, OutputFormat};
use crate::rpc_client::{self, ClientError};

/// Arguments of the time command.
#[derive(Debug, Args)]
pub struct TimeCmd {
    /// Stop after this many values. Streams until ctrl-c when omitted.
    #[arg(long)]
    pub count: Option<u64>,

    /// Framing the duplex binding is configured with.
    #[arg(long, value_enum, default_value_t = FramingArg::Lines)]
    pub framing: FramingArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FramingArg {
    Lines,
    LengthDelimited,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Lines => Framing::Lines,
            FramingArg::LengthDelimited => Framing::LengthDelimited,
        }
    }
}

enum Step {
    Frame(Option<Result<Bytes, std::io::Error>>),
    Interrupt,
}

fn stream_input(count: Option<u64>) -> Value {
    match count {
        Some(limit) => json!({ "limit": limit }),
        None => Value::Null,
    }
}

async fn send_json(
    framed: &mut Framed<TcpStream, FrameCodec>,
    value: &impl serde::Serialize,
) -> Result<(), ClientError> {
    let bytes = serde_json::to_vec(value)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Run the time command against the duplex binding at `addr`.
pub async fn run(cmd: &TimeCmd, addr: &str, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(addr).await.map_err(ClientError::from)?;
    let codec = FrameCodec::new(cmd.framing.into(), DEFAULT_MAX_FRAME_LENGTH);
    let mut framed = Framed::new(stream, codec);

    let call = rpc_client::call_envelope("time.stream", stream_input(cmd.count));
    let call_id = call.call_id.clone();
    send_json(&mut framed, &call).await?;

    let mut interrupted = false;
    loop {
        let step = tokio::select! {
            frame = framed.next() => Step::Frame(frame),
            _ = tokio::signal::ctrl_c(), if !interrupted => Step::Interrupt,
        };

        let frame = match step {
            Step::Interrupt => {
                interrupted = true;
                send_json(&mut framed, &json!({ "cancel": call_id })).await?;
                continue;
            }
            Step::Frame(Some(frame)) => frame.map_err(ClientError::from)?,
            Step::Frame(None) => return Err("Connection closed before the stream ended".into()),
        };

        let envelope: ResponseEnvelope = serde_json::from_slice(&frame)?;
        if envelope.call_id != call_id {
            continue;
        }
        match &envelope.body {
            ResponseBody::Event { value } => print_tick(value, format),
            ResponseBody::Complete => break,
            ResponseBody::Aborted => {
                println!("Stream cancelled");
                break;
            }
            ResponseBody::Error { .. } | ResponseBody::Success { .. } => {
                return Err(match rpc_client::into_value(envelope) {
                    Err(e) => e.into(),
                    Ok(_) => ClientError::Unexpected("success").into(),
                });
            }
        }
    }

    Ok(())
}

fn print_tick(value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", format_json(value)),
        OutputFormat::Table => println!(
            "{}  {}",
            value["timestamp"].as_str().unwrap_or("-"),
            value["formatted"].as_str().unwrap_or("-")
        ),
    }
}
