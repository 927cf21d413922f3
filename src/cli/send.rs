use anyhow::Context;
use clap::Args;
use jarvis::comms::CommsSurface;
use protocol_runtime::Envelope;

use super::CliContext;

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Envelope as JSON, e.g. '{"kind":"request","command":"list",...}'
    pub envelope: String,
}

/// Debug helper: writes the envelope where the native host would.
pub async fn execute(args: SendArgs, context: &CliContext) -> anyhow::Result<()> {
    let envelope = Envelope::decode(&args.envelope).context("not a valid envelope")?;
    let comms = CommsSurface::new(context.root.join("comms"));
    comms.send_inbound(&envelope).await?;
    println!("Queued `{}` for the hub.", envelope.message_id);
    Ok(())
}
