use anyhow::anyhow;
use sluice_core::SessionError;

/// Failure injected into the next statements of any connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The connection is lost, its transaction rolled back.
    Disconnect,
    SerializationFailure,
    Deadlock,
    /// Engine error that is neither a conflict nor a lost connection.
    Internal,
}

impl Fault {
    pub(crate) fn error(&self) -> SessionError {
        match self {
            Fault::Disconnect => {
                SessionError::disconnected(anyhow!("server closed the connection unexpectedly"))
            }
            Fault::SerializationFailure => SessionError::SerializationConflict(
                "could not serialize access due to concurrent update (injected)".into(),
            ),
            Fault::Deadlock => SessionError::DeadlockDetected("injected deadlock".into()),
            Fault::Internal => SessionError::driver(anyhow!("internal error (injected)")),
        }
    }
}

/// Pending injected failures, consumed one per operation.
#[derive(Default, Debug)]
pub(crate) struct Faults {
    pub(crate) refused_connections: usize,
    pub(crate) statements: Vec<(Fault, usize)>,
    pub(crate) commits: usize,
    pub(crate) probes: usize,
}

impl Faults {
    pub(crate) fn take_connection_refusal(&mut self) -> bool {
        take(&mut self.refused_connections)
    }

    pub(crate) fn take_statement(&mut self) -> Option<Fault> {
        let (fault, remaining) = self.statements.first_mut()?;
        let fault = *fault;
        *remaining -= 1;
        if *remaining == 0 {
            self.statements.remove(0);
        }
        Some(fault)
    }

    pub(crate) fn take_commit(&mut self) -> bool {
        take(&mut self.commits)
    }

    pub(crate) fn take_probe(&mut self) -> bool {
        take(&mut self.probes)
    }
}

fn take(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}
