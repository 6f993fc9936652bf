//! Protocol version negotiation.

use super::{status, NdisCapability, NvspMessage, ProtocolVersion};
use crate::config::ETH_HLEN;
use crate::error::{Result, SetupError};

/// Control path used during bring-up.
///
/// `request` sends a message and blocks until the matching completion lands
/// in the init response holder. `post` is one-way.
pub trait ControlChannel {
    fn request(&self, msg: &NvspMessage) -> Result<NvspMessage>;
    fn post(&self, msg: &NvspMessage) -> Result<()>;
}

/// Pick the newest protocol version the peer accepts.
///
/// `candidates` is ordered oldest first. Each version is offered on its own
/// (`min == max`). A failed send moves on to the next older version; a closed
/// channel or an exhausted wait aborts. For versions that take it, the NDIS
/// config message follows; its failure is returned as is.
pub fn negotiate<C: ControlChannel + ?Sized>(
    chan: &C,
    candidates: &[ProtocolVersion],
    mtu: u32,
) -> Result<ProtocolVersion> {
    let mut chosen = None;

    for &version in candidates.iter().rev() {
        let init = NvspMessage::Init { min: version, max: version };
        match chan.request(&init) {
            Ok(NvspMessage::InitComplete { status: st, .. }) if st == status::SUCCESS => {
                chosen = Some(version);
                break;
            }
            Ok(NvspMessage::InitComplete { status: st, .. }) => {
                debug!("netvsc: peer refused protocol {} (status {})", version, st);
            }
            Ok(other) => return Err(SetupError::UnexpectedResponse(other.msg_type())),
            Err(SetupError::Transport(e)) => {
                warn!("netvsc: init for protocol {} not sent: {}", version, e);
            }
            Err(e) => return Err(e),
        }
    }

    let version = chosen.ok_or(SetupError::NoCommonVersion)?;
    info!("netvsc: negotiated protocol {}", version);

    if version.has_ndis_config() {
        chan.post(&NvspMessage::SendNdisConfig {
            mtu: mtu + ETH_HLEN,
            capabilities: NdisCapability::for_version(version),
        })?;
    }

    Ok(version)
}

/// Announce the NDIS version matching the negotiated protocol.
pub fn send_ndis_version<C: ControlChannel + ?Sized>(
    chan: &C,
    version: ProtocolVersion,
) -> Result<()> {
    chan.post(&NvspMessage::SendNdisVersion(version.ndis_version()))
}
