//! Maintenance-state handshake.

use ploop_shared::errors::{PloopError, PloopResult};

use super::{Admission, BalloonOp, BalloonReply, BalloonRequest, ControlDevice, MaintenanceState};

/// Device ownership acquired for one balloon operation.
///
/// While armed, dropping the session asks the device to leave maintenance
/// mode. A failure to do so is logged and otherwise ignored: the caller is
/// already on its way out with its own result.
#[must_use = "dropping the session immediately resets the device state"]
pub struct MaintenanceSession<'a, D: ControlDevice + ?Sized> {
    device: &'a D,
    op: BalloonOp,
    grant: BalloonReply,
    armed: bool,
}

impl<'a, D: ControlDevice + ?Sized> MaintenanceSession<'a, D> {
    /// Request the maintenance mode `op` needs and check the device's answer.
    ///
    /// Fails with [`PloopError::Busy`] or [`PloopError::Protocol`] per the
    /// admission table; nothing is reset in that case.
    pub fn begin(device: &'a D, op: BalloonOp) -> PloopResult<Self> {
        let request = BalloonRequest {
            inflate: op.inflate(),
            keep_intact: op.keep_intact(),
        };
        let grant = device.balloon(request)?;
        op.require(grant.state)?;

        tracing::debug!(op = %op, state = %grant.state, level = grant.level, "Maintenance granted");
        Ok(Self {
            device,
            op,
            grant,
            armed: !op.keep_intact(),
        })
    }

    /// State, level and allocation head reported when the session began.
    pub fn grant(&self) -> &BalloonReply {
        &self.grant
    }

    /// What `complete` should do with the reported state.
    pub fn admission(&self) -> Admission {
        self.op.admit(self.grant.state)
    }

    /// Leave the device state alone on drop.
    ///
    /// Used once the device has taken over the operation (a loaded
    /// free-block list must survive for `complete`).
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl<D: ControlDevice + ?Sized> Drop for MaintenanceSession<'_, D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.device.balloon(BalloonRequest::off()) {
            Ok(reply) if reply.state == MaintenanceState::Off => {
                tracing::debug!(op = %self.op, "Maintenance state reset");
            }
            Ok(reply) => {
                tracing::warn!(
                    op = %self.op,
                    state = %reply.state,
                    "Device did not leave maintenance state"
                );
            }
            Err(e) => {
                tracing::warn!(op = %self.op, error = %e, "Failed to reset maintenance state");
            }
        }
    }
}

/// Report the current maintenance mode without changing it.
pub fn query_state<D: ControlDevice + ?Sized>(device: &D) -> PloopResult<BalloonReply> {
    device.balloon(BalloonRequest::query())
}

/// Ask the device to leave maintenance mode.
///
/// A device that stays in some other mode holds stale in-kernel state and is
/// reported as busy.
pub fn clear_state<D: ControlDevice + ?Sized>(device: &D) -> PloopResult<()> {
    let reply = device.balloon(BalloonRequest::off())?;
    if reply.state != MaintenanceState::Off {
        return Err(PloopError::Busy(format!(
            "can't clear stale in-kernel balloon state: device is in {} state",
            reply.state
        )));
    }
    tracing::info!("Balloon state cleared");
    Ok(())
}
