#[cfg(test)]
mod client_tests {
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use crate::test::helpers::{
        attach_test_node, cid, create_session, gid, wait_until, MockGateway, RecordingGateway,
    };
    use crate::{
        AudioClient, AudioError, ChannelNodeTransport, Frame, GatewayPayload, NodeConfig,
        NodeEvent, SOURCE_START, VC_CREATED, VC_DESTROYED, VOICE_SERVER_UPDATE,
        VOICE_STATE_UPDATE,
    };

    fn vc_created(guild: u64) -> NodeEvent {
        NodeEvent::from_frame(Frame::new(VC_CREATED, json!({ "guild_id": guild })))
    }

    fn vc_destroyed(guild: u64) -> NodeEvent {
        NodeEvent::from_frame(Frame::new(VC_DESTROYED, json!({ "guild_id": guild })))
    }

    //------------------------------------
    // Connection coordination
    //------------------------------------

    #[tokio::test]
    async fn test_connect_confirms_against_chosen_node() {
        let (transport, _frames) = ChannelNodeTransport::pair();
        let (events_tx, events_rx) = mpsc::channel(64);

        let mut gateway = MockGateway::new();
        let tx = events_tx.clone();
        gateway
            .expect_update_voice_state()
            .withf(|guild, channel| *guild == gid(10) && *channel == Some(cid(20)))
            .times(1)
            .returning(move |guild, _| {
                // The node answers the join with a session confirmation.
                tx.try_send(NodeEvent::from_frame(Frame::new(
                    VC_CREATED,
                    json!({ "guild_id": guild.get(), "channel_id": 20 }),
                )))
                .expect("event channel open");
                Ok(())
            });

        let client = AudioClient::new(Arc::new(gateway), 1);
        let node = client
            .attach_node(
                NodeConfig::endpoint("127.0.0.1", 8000),
                Box::new(transport),
                events_rx,
            )
            .unwrap();

        let session = client.connect(gid(10), cid(20), None).await.unwrap();

        assert_eq!(session.guild_id(), gid(10));
        assert_eq!(session.channel_id(), Some(cid(20)));
        assert!(session.is_on(&node));
        assert!(!client.has_reservation(gid(10)));
        assert!(client.get_session(gid(10)).unwrap().is_on(&node));
    }

    #[tokio::test]
    async fn test_connect_without_nodes_fails() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let result = client.connect(gid(1), cid(2), None).await;
        assert!(matches!(result, Err(AudioError::NodeUnavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_confirmation() {
        let gateway = RecordingGateway::new();
        let client = AudioClient::new(gateway.clone(), 1);
        let _node = attach_test_node(&client, 8000);

        let result = client.connect(gid(1), cid(2), None).await;

        match result {
            Err(AudioError::Timeout(name)) => assert_eq!(name, VC_CREATED),
            other => panic!("expected timeout, got {other:?}"),
        }
        // The join went out, and the reservation is not left dangling.
        assert_eq!(gateway.calls(), vec![(gid(1), Some(cid(2)))]);
        assert!(!client.has_reservation(gid(1)));
    }

    #[tokio::test]
    async fn test_connect_moves_guild_between_nodes() {
        let (transport_a, mut frames_a) = ChannelNodeTransport::pair();
        let (transport_b, _frames_b) = ChannelNodeTransport::pair();
        let (events_a_tx, events_a_rx) = mpsc::channel(64);
        let (events_b_tx, events_b_rx) = mpsc::channel(64);

        let mut gateway = MockGateway::new();
        let joins = Arc::new(AtomicUsize::new(0));
        let (tx_a, tx_b) = (events_a_tx.clone(), events_b_tx.clone());
        gateway
            .expect_update_voice_state()
            .withf(|_, channel| channel.is_some())
            .times(2)
            .returning(move |guild, _| {
                let confirmation = NodeEvent::from_frame(Frame::new(
                    VC_CREATED,
                    json!({ "guild_id": guild.get() }),
                ));
                let target = if joins.fetch_add(1, Ordering::SeqCst) == 0 {
                    &tx_a
                } else {
                    &tx_b
                };
                target.try_send(confirmation).expect("event channel open");
                Ok(())
            });
        // Leave calls come from VC_DESTROYED handling.
        gateway
            .expect_update_voice_state()
            .withf(|_, channel| channel.is_none())
            .returning(|_, _| Ok(()));

        let client = AudioClient::new(Arc::new(gateway), 1);
        let node_a = client
            .attach_node(
                NodeConfig::endpoint("127.0.0.1", 8000),
                Box::new(transport_a),
                events_a_rx,
            )
            .unwrap();
        let node_b = client
            .attach_node(
                NodeConfig::endpoint("127.0.0.1", 8001),
                Box::new(transport_b),
                events_b_rx,
            )
            .unwrap();

        let first = client
            .connect(gid(123), cid(456), Some(Arc::clone(&node_a)))
            .await
            .unwrap();
        assert!(first.is_on(&node_a));

        let second = client
            .connect(gid(123), cid(456), Some(Arc::clone(&node_b)))
            .await
            .unwrap();
        assert!(second.is_on(&node_b));

        // The old session was told to tear down before the move.
        let teardown = frames_a.try_recv().expect("teardown frame sent");
        assert_eq!(teardown.name, "VC_DESTROY");
        assert_eq!(teardown.data["guild_id"], 123);

        // Once the old node reports the teardown, exactly one session is
        // left, on the new node.
        events_a_tx.send(vc_destroyed(123)).await.unwrap();
        let a = Arc::clone(&node_a);
        wait_until(move || a.session_count() == 0).await;
        assert_eq!(client.sessions().len(), 1);
        assert!(client.get_session(gid(123)).unwrap().is_on(&node_b));
    }

    #[tokio::test]
    async fn test_connect_same_node_reuses_session() {
        let (transport, _frames) = ChannelNodeTransport::pair();
        let (events_tx, events_rx) = mpsc::channel(64);

        let mut gateway = MockGateway::new();
        let joins = Arc::new(AtomicUsize::new(0));
        let tx = events_tx.clone();
        gateway
            .expect_update_voice_state()
            .times(2)
            .returning(move |guild, _| {
                // Only the first join needs a confirmation; the second is a
                // channel move on a live session.
                if joins.fetch_add(1, Ordering::SeqCst) == 0 {
                    tx.try_send(NodeEvent::from_frame(Frame::new(
                        VC_CREATED,
                        json!({ "guild_id": guild.get() }),
                    )))
                    .expect("event channel open");
                }
                Ok(())
            });

        let client = AudioClient::new(Arc::new(gateway), 1);
        let node = client
            .attach_node(
                NodeConfig::endpoint("127.0.0.1", 8000),
                Box::new(transport),
                events_rx,
            )
            .unwrap();

        let first = client.connect(gid(1), cid(2), None).await.unwrap();
        let second = client.connect(gid(1), cid(3), None).await.unwrap();

        assert!(first.is_on(&node));
        assert!(second.is_on(&node));
        assert_eq!(client.sessions().len(), 1);
        assert!(!client.has_reservation(gid(1)));
    }

    #[tokio::test]
    async fn test_concurrent_connects_distinct_guilds() {
        let gateway = RecordingGateway::new();
        let client = AudioClient::new(gateway.clone(), 1);
        let node = attach_test_node(&client, 8000);

        let mut handles = Vec::new();
        for guild in 1..=3u64 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.connect(gid(guild), cid(guild * 10), None).await
            }));
        }

        // Wait for every join to go out, then confirm each one.
        let recorder = gateway.clone();
        wait_until(move || recorder.calls().len() == 3).await;
        for guild in 1..=3u64 {
            node.events.send(vc_created(guild)).await.unwrap();
        }

        for handle in handles {
            let session = handle.await.unwrap().unwrap();
            assert!(session.is_on(&node.node));
        }
        assert_eq!(client.session_count(), 3);
    }

    //------------------------------------
    // Session lookup and teardown
    //------------------------------------

    #[tokio::test]
    async fn test_session_lookup_safe_and_strict() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let node = attach_test_node(&client, 8000);

        assert!(client.find_session(gid(1)).is_none());
        assert!(matches!(
            client.get_session(gid(1)),
            Err(AudioError::SessionNotFound(guild)) if guild == gid(1)
        ));

        create_session(&node, 1).await;
        assert!(client.find_session(gid(1)).is_some());
        assert!(client.get_session(gid(1)).is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_sends_leave_only() {
        let gateway = RecordingGateway::new();
        let client = AudioClient::new(gateway.clone(), 1);
        let mut node = attach_test_node(&client, 8000);
        create_session(&node, 4).await;

        client.disconnect(gid(4)).await.unwrap();

        assert_eq!(gateway.calls(), vec![(gid(4), None)]);
        // No node traffic: teardown rides the destroyed-event side channel.
        assert!(node.frames.try_recv().is_err());
        // The session survives until the node says otherwise.
        assert!(client.find_session(gid(4)).is_some());
    }

    #[tokio::test]
    async fn test_destroy_requires_session() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let _node = attach_test_node(&client, 8000);

        assert!(matches!(
            client.destroy(gid(5)).await,
            Err(AudioError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_clears_voice_state_and_node_session() {
        let gateway = RecordingGateway::new();
        let client = AudioClient::new(gateway.clone(), 1);
        let mut node = attach_test_node(&client, 8000);
        create_session(&node, 5).await;

        client.destroy(gid(5)).await.unwrap();

        let teardown = node.frames.try_recv().expect("teardown frame sent");
        assert_eq!(teardown.name, "VC_DESTROY");
        assert_eq!(teardown.data["guild_id"], 5);
        assert!(gateway.calls().contains(&(gid(5), None)));

        node.events.send(vc_destroyed(5)).await.unwrap();
        let client_view = client.clone();
        wait_until(move || client_view.find_session(gid(5)).is_none()).await;
    }

    #[tokio::test]
    async fn test_session_ops_reach_the_owning_node() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let mut node = attach_test_node(&client, 8000);
        let session = create_session(&node, 11).await;

        session.skip(2).await.unwrap();
        session.set_volume(0.5).await.unwrap();
        session.pause().await.unwrap();
        let mut context = serde_json::Map::new();
        context.insert("textChannel".to_owned(), json!(77));
        session.set_context(context).await.unwrap();

        let skip = node.frames.try_recv().unwrap();
        assert_eq!(skip.name, "SKIP");
        assert_eq!(skip.data["guild_id"], 11);
        assert_eq!(skip.data["offset"], 2);

        let volume = node.frames.try_recv().unwrap();
        assert_eq!(volume.name, "SET_VOLUME");
        assert_eq!(volume.data["volume"], 0.5);

        assert_eq!(node.frames.try_recv().unwrap().name, "PAUSE");

        let context_frame = node.frames.try_recv().unwrap();
        assert_eq!(context_frame.name, "SET_CONTEXT");
        assert_eq!(context_frame.data["context"]["textChannel"], 77);
        // The local copy is readable without a round trip.
        assert_eq!(session.context_value("textChannel"), Some(json!(77)));

        // Ops fail cleanly once the transport is gone.
        node.node.close();
        assert!(session.pause().await.is_err());
    }

    //------------------------------------
    // Gateway payload routing
    //------------------------------------

    #[tokio::test]
    async fn test_router_sends_voice_payload_to_session_node() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let mut a = attach_test_node(&client, 8000);
        let mut b = attach_test_node(&client, 8001);
        create_session(&a, 9).await;

        let payload = GatewayPayload::new(VOICE_SERVER_UPDATE, json!({ "guild_id": "9" }));
        client.dispatch(&payload).await;

        let forwarded = a.frames.try_recv().expect("owning node gets the payload");
        assert_eq!(forwarded.name, "DISCORD_DISPATCH");
        assert_eq!(forwarded.data["t"], VOICE_SERVER_UPDATE);
        assert!(b.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_router_reservation_takes_precedence() {
        let gateway = RecordingGateway::new();
        let client = AudioClient::new(gateway.clone(), 1);
        let mut a = attach_test_node(&client, 8000);
        let mut b = attach_test_node(&client, 8001);
        create_session(&a, 9).await;

        // Start moving guild 9 to node B; the connect parks on the node
        // confirmation, leaving its reservation visible.
        let mover = {
            let client = client.clone();
            let target = Arc::clone(&b.node);
            tokio::spawn(async move { client.connect(gid(9), cid(90), Some(target)).await })
        };
        let client_view = client.clone();
        wait_until(move || client_view.has_reservation(gid(9))).await;

        let payload = GatewayPayload::new(VOICE_STATE_UPDATE, json!({ "guild_id": "9" }));
        client.dispatch(&payload).await;

        // The stale teardown went to A; the handshake payload went to B.
        let teardown = a.frames.try_recv().expect("teardown frame sent");
        assert_eq!(teardown.name, "VC_DESTROY");
        assert!(a.frames.try_recv().is_err());
        let forwarded = b.frames.try_recv().expect("reserved node gets the payload");
        assert_eq!(forwarded.name, "DISCORD_DISPATCH");

        b.events.send(vc_created(9)).await.unwrap();
        let session = mover.await.unwrap().unwrap();
        assert!(session.is_on(&b.node));
        assert!(!client.has_reservation(gid(9)));
    }

    #[tokio::test]
    async fn test_router_unknown_guild_falls_back_to_best_node() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let mut busy = attach_test_node(&client, 8000);
        let mut idle = attach_test_node(&client, 8001);
        create_session(&busy, 1).await;

        // Guild 2 has no session and no reservation: its first handshake
        // packet still lands on the least-loaded node.
        let payload = GatewayPayload::new(VOICE_STATE_UPDATE, json!({ "guild_id": "2" }));
        client.dispatch(&payload).await;

        assert!(busy.frames.try_recv().is_err());
        let forwarded = idle.frames.try_recv().expect("best node gets the payload");
        assert_eq!(forwarded.data["d"]["guild_id"], "2");
    }

    #[tokio::test]
    async fn test_router_broadcasts_other_payloads() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let mut a = attach_test_node(&client, 8000);
        let mut b = attach_test_node(&client, 8001);

        let payload = GatewayPayload::new("USER_UPDATE", json!({ "id": "7" }));
        client.dispatch(&payload).await;

        assert_eq!(a.frames.try_recv().unwrap().data["t"], "USER_UPDATE");
        assert_eq!(b.frames.try_recv().unwrap().data["t"], "USER_UPDATE");
    }

    #[tokio::test]
    async fn test_router_skips_disconnected_and_tolerates_empty_pool() {
        let client = AudioClient::new(RecordingGateway::new(), 1);

        // Zero nodes: a broadcast is a silent no-op.
        client
            .dispatch(&GatewayPayload::new("USER_UPDATE", json!({})))
            .await;

        let mut a = attach_test_node(&client, 8000);
        let mut b = attach_test_node(&client, 8001);
        a.node.close();

        client
            .dispatch(&GatewayPayload::new("USER_UPDATE", json!({})))
            .await;
        assert!(a.frames.try_recv().is_err());
        assert!(b.frames.try_recv().is_ok());
    }

    //------------------------------------
    // Node event fan-out
    //------------------------------------

    #[tokio::test]
    async fn test_destroyed_event_without_session_still_leaves_voice() {
        let gateway = RecordingGateway::new();
        let client = AudioClient::new(gateway.clone(), 1);
        let node = attach_test_node(&client, 8000);

        node.events.send(vc_destroyed(789)).await.unwrap();

        let recorder = gateway.clone();
        wait_until(move || recorder.calls() == vec![(gid(789), None)]).await;
    }

    #[tokio::test]
    async fn test_source_events_reach_subscribers() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let node = attach_test_node(&client, 8000);
        create_session(&node, 3).await;

        let seen: Arc<Mutex<Vec<(u64, serde_json::Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.dispatcher.on(SOURCE_START, move |session, payload| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push((session.guild_id().get(), payload));
            }
        });

        node.events
            .send(NodeEvent::from_frame(Frame::new(
                SOURCE_START,
                json!({ "guild_id": 3, "source": { "title": "song" } }),
            )))
            .await
            .unwrap();

        let sink = Arc::clone(&seen);
        wait_until(move || !sink.lock().is_empty()).await;
        {
            let seen = seen.lock();
            assert_eq!(seen[0].0, 3);
            assert_eq!(seen[0].1["source"]["title"], "song");
        }

        // The same event for a guild without a session is dropped.
        node.events
            .send(NodeEvent::from_frame(Frame::new(
                SOURCE_START,
                json!({ "guild_id": 999, "source": { "title": "ghost" } }),
            )))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_events_pass_through() {
        let client = AudioClient::new(RecordingGateway::new(), 1);
        let node = attach_test_node(&client, 8000);
        create_session(&node, 6).await;

        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        client.dispatcher.on("QUEUE_CHANGED", move |_, _| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock() += 1;
            }
        });

        node.events
            .send(NodeEvent::from_frame(Frame::new(
                "QUEUE_CHANGED",
                json!({ "guild_id": 6, "entries": 4 }),
            )))
            .await
            .unwrap();

        let sink = Arc::clone(&seen);
        wait_until(move || *sink.lock() == 1).await;
    }

    #[tokio::test]
    async fn test_resumed_node_reconciles_sessions() {
        let gateway = RecordingGateway::new();
        let client = AudioClient::new(gateway.clone(), 1);
        let node = attach_test_node(&client, 8000);

        node.events
            .send(NodeEvent::from_frame(Frame::new(
                "RESUMED",
                json!({ "voice_clients": {
                    "5": { "channel": 50 },
                    "8": { "channel": null }
                }}),
            )))
            .await
            .unwrap();

        // Guild 5 gets re-joined on the same node, guild 8 gets dropped.
        let recorder = gateway.clone();
        wait_until(move || {
            let calls = recorder.calls();
            calls.contains(&(gid(5), Some(cid(50)))) && calls.contains(&(gid(8), None))
        })
        .await;

        node.events.send(vc_created(5)).await.unwrap();
        let client_view = client.clone();
        wait_until(move || client_view.find_session(gid(5)).is_some()).await;
        assert!(client.find_session(gid(5)).unwrap().is_on(&node.node));
    }
}
