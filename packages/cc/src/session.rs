use crate::prelude::*;
use std::collections::HashMap;
use zwh_core::prelude::*;

/// Identifies the partial CCs that belong to one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    node_id: NodeId,
    cc_id: CommandClasses,
    cc_command: Option<u8>,
    session_id: u32,
}

/// Buffers command classes that span multiple frames until their session is
/// complete, then merges them through the CC's own merge routine.
#[derive(Default)]
pub struct PartialCCSessions {
    sessions: HashMap<SessionKey, Vec<CC>>,
}

impl PartialCCSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a received CC into the session store.
    /// Returns `Some(cc)` when the CC is complete (possibly after merging
    /// buffered partials) and `None` when more frames are expected.
    /// A merge failure drops the whole aggregate.
    pub fn handle(
        &mut self,
        node_id: NodeId,
        mut cc: CC,
        ctx: &CCParsingContext,
    ) -> ParseResult<Option<CC>> {
        let Some(session_id) = cc.session_id() else {
            return Ok(Some(cc));
        };

        let key = SessionKey {
            node_id,
            cc_id: cc.cc_id(),
            cc_command: cc.cc_command(),
            session_id,
        };

        let buffered = self.sessions.entry(key).or_default();
        if cc.is_session_complete(buffered) {
            let others = self.sessions.remove(&key).unwrap_or_default();
            match cc.merge_session(ctx, others) {
                Ok(()) => Ok(Some(cc)),
                Err(e) => {
                    // The aggregate is already removed from the store
                    Err(e)
                }
            }
        } else {
            buffered.push(cc);
            Ok(None)
        }
    }

    /// Drops all buffered partials for the given node
    pub fn purge_node(&mut self, node_id: NodeId) {
        self.sessions.retain(|key, _| key.node_id != node_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_non_partial_passes_through() {
        let mut sessions = PartialCCSessions::new();
        let cc: CC = BasicCCGet::default().into();
        let result = sessions
            .handle(NodeId::new(2u8), cc.clone(), &CCParsingContext::default())
            .unwrap();
        assert_eq!(result, Some(cc));
    }

    #[test]
    fn test_purge_node() {
        let mut sessions = PartialCCSessions::new();
        sessions.sessions.insert(
            SessionKey {
                node_id: NodeId::new(3u8),
                cc_id: CommandClasses::Security,
                cc_command: Some(0x81),
                session_id: 1,
            },
            vec![],
        );
        sessions.purge_node(NodeId::new(3u8));
        assert!(sessions.sessions.is_empty());
    }
}
