use std::fmt;

use crate::verbs::context::Context;
use crate::verbs::error::{Result, VerbsError};
use crate::verbs::qp::Qp;
use crate::verbs::type_alias::*;

/// Endpoint (device port & queue pair) data.
///
/// This is the address a peer needs to reach a QP; it is plain data and
/// serializable, so it can be exchanged out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QpEndpoint {
    pub port_num: PortNum,
    pub qpn: Qpn,
}

impl QpEndpoint {
    /// Create an endpoint from a queue pair. Return `None` if the QP is
    /// not yet bound to a port (i.e., it is still in the Reset state).
    pub fn of_qp(qp: &Qp) -> Option<Self> {
        Some(QpEndpoint {
            port_num: qp.port()?,
            qpn: qp.qp_num(),
        })
    }

    /// Serialize the endpoint to JSON for out-of-band exchange.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("endpoint serialization cannot fail")
    }

    /// Parse an endpoint from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|_| VerbsError::InvalidParameter("malformed endpoint JSON"))
    }
}

/// A resolved path to a peer queue pair, consumed when transitioning a
/// connected QP to Ready-To-Receive or addressing a datagram send.
///
/// Resolution validates that the endpoint is reachable on this device;
/// an unresolvable endpoint fails with `InvalidParameter`.
#[derive(Clone)]
pub struct QpPeer {
    ep: QpEndpoint,
}

impl fmt::Debug for QpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QpPeer").field("endpoint", &self.ep).finish()
    }
}

impl QpPeer {
    /// Resolve a path to the given endpoint.
    pub fn resolve(ctx: &Context, ep: QpEndpoint) -> Result<Self> {
        if !ctx.port_active(ep.port_num) {
            return Err(VerbsError::InvalidParameter("peer port is not active"));
        }
        if ctx.lookup_qp(ep.qpn).is_none() {
            return Err(VerbsError::InvalidParameter("peer queue pair does not resolve"));
        }
        Ok(Self { ep })
    }

    /// Get the endpoint information of this peer.
    #[inline]
    pub fn endpoint(&self) -> &QpEndpoint {
        &self.ep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_json_roundtrip() {
        let ep = QpEndpoint { port_num: 1, qpn: 42 };
        let parsed = QpEndpoint::from_json(&ep.to_json()).unwrap();
        assert_eq!(parsed, ep);
        assert!(QpEndpoint::from_json("{").is_err());
    }
}
