pub mod client_tests;

pub mod helpers {
    use async_trait::async_trait;
    use mockall::mock;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::{
        AudioClient, AudioError, ChannelId, ChannelNodeTransport, Frame, GuildId, Node,
        NodeConfig, NodeEvent, Session, VoiceGateway, VC_CREATED,
    };

    pub fn gid(id: u64) -> GuildId {
        GuildId::new(id).expect("nonzero guild id")
    }

    pub fn cid(id: u64) -> ChannelId {
        ChannelId::new(id).expect("nonzero channel id")
    }

    mock! {
        pub Gateway {}

        #[async_trait]
        impl VoiceGateway for Gateway {
            async fn update_voice_state(
                &self,
                guild: GuildId,
                channel: Option<ChannelId>,
            ) -> Result<(), AudioError>;
        }
    }

    /// Gateway that records every voice-state call and always succeeds.
    #[derive(Default)]
    pub struct RecordingGateway {
        calls: Mutex<Vec<(GuildId, Option<ChannelId>)>>,
    }

    impl RecordingGateway {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> Vec<(GuildId, Option<ChannelId>)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl VoiceGateway for RecordingGateway {
        async fn update_voice_state(
            &self,
            guild: GuildId,
            channel: Option<ChannelId>,
        ) -> Result<(), AudioError> {
            self.calls.lock().push((guild, channel));
            Ok(())
        }
    }

    /// A node attached over in-memory channels: the test reads what the
    /// client sends on `frames` and plays the node by pushing `events`.
    pub struct TestNode {
        pub node: Arc<Node>,
        pub frames: mpsc::UnboundedReceiver<Frame>,
        pub events: mpsc::Sender<NodeEvent>,
    }

    pub fn attach_test_node(client: &AudioClient, port: u16) -> TestNode {
        let (transport, frames) = ChannelNodeTransport::pair();
        let (events_tx, events_rx) = mpsc::channel(64);
        let node = client
            .attach_node(
                NodeConfig::endpoint("127.0.0.1", port),
                Box::new(transport),
                events_rx,
            )
            .expect("attach test node");
        TestNode {
            node,
            frames,
            events: events_tx,
        }
    }

    /// Poll a condition until it holds; panics if it never does.
    pub async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not met in time");
    }

    /// Have the scripted node report a session for the guild, and wait for
    /// the client to pick it up.
    pub async fn create_session(test_node: &TestNode, guild: u64) -> Session {
        test_node
            .events
            .send(NodeEvent::from_frame(Frame::new(
                VC_CREATED,
                json!({ "guild_id": guild }),
            )))
            .await
            .expect("node event channel open");
        let node = Arc::clone(&test_node.node);
        wait_until(move || node.session(gid(guild)).is_some()).await;
        test_node
            .node
            .session(gid(guild))
            .expect("session just created")
    }
}
