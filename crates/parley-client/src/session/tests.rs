use super::*;
use crate::media::{HeadlessElements, SyntheticDevices};
use crate::peer::testing::{FakeFactory, FakePeer};
use crate::peer::IceConnectionState;
use parley_protocol::MediaPatch;

struct Member {
    id: ParticipantId,
    session: ConferenceSession,
    factory: Arc<FakeFactory>,
    signals: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    seen: Vec<SessionEvent>,
    ended: bool,
}

async fn member(id: &str) -> Member {
    member_with(id, SyntheticDevices::new(true, true)).await
}

async fn member_with(id: &str, devices: SyntheticDevices) -> Member {
    let factory = Arc::new(FakeFactory::default());
    let (signal_tx, signals) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let deps = SessionDeps {
        devices: Arc::new(devices),
        peers: factory.clone(),
        elements: Arc::new(HeadlessElements),
    };
    let session = ConferenceSession::create(SessionOptions::default(), deps, signal_tx, event_tx)
        .await
        .unwrap();

    Member {
        id: ParticipantId::from(id),
        session,
        factory,
        signals,
        events,
        seen: Vec::new(),
        ended: false,
    }
}

impl Member {
    fn deliver(&self, message: ServerMessage) {
        self.session
            .inputs()
            .send(SessionInput::Server(message))
            .unwrap();
    }

    async fn command(&mut self, command: LocalCommand) {
        if self
            .session
            .handle_input(SessionInput::Command(command))
            .await
            .is_break()
        {
            self.ended = true;
        }
    }

    fn events(&mut self) -> &[SessionEvent] {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    fn tiles(&mut self, id: &str) -> Vec<Tile> {
        let id = ParticipantId::from(id);
        self.events()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::TileUpdated { id: tile_id, tile } if *tile_id == id => Some(*tile),
                _ => None,
            })
            .collect()
    }

    fn peer(&self, remote: &str) -> Arc<FakePeer> {
        self.factory.peer(&ParticipantId::from(remote))
    }
}

/// Stands in for the signaling server.
#[derive(Default)]
struct Room {
    members: Vec<Member>,
}

impl Room {
    fn get(&mut self, id: &str) -> &mut Member {
        let id = ParticipantId::from(id);
        self.members
            .iter_mut()
            .find(|m| m.id == id)
            .unwrap_or_else(|| panic!("{} is not in the room", id))
    }

    fn join(&mut self, member: Member) {
        let record = PresenceRecord::new(member.id.clone());
        for existing in &self.members {
            existing.deliver(ServerMessage::joined(record.clone()));
        }

        let mut participants: Vec<PresenceRecord> = self
            .members
            .iter()
            .map(|m| PresenceRecord::new(m.id.clone()))
            .collect();
        participants.push(record);
        member.deliver(ServerMessage::PresenceSync {
            participants,
            self_id: member.id.clone(),
        });
        self.members.push(member);
    }

    fn leave(&mut self, id: &str) -> Member {
        let id = ParticipantId::from(id);
        let index = self
            .members
            .iter()
            .position(|m| m.id == id)
            .unwrap_or_else(|| panic!("{} is not in the room", id));
        let gone = self.members.remove(index);
        for member in &self.members {
            member.deliver(ServerMessage::left(id.clone()));
        }
        gone
    }

    async fn settle(&mut self) {
        for _ in 0..64 {
            let mut progressed = false;

            for member in self.members.iter_mut() {
                while let Ok(input) = member.session.input_rx.try_recv() {
                    if member.ended {
                        continue;
                    }
                    progressed = true;
                    if member.session.handle_input(input).await.is_break() {
                        member.ended = true;
                    }
                }
            }

            let mut outgoing = Vec::new();
            for member in self.members.iter_mut() {
                while let Ok(message) = member.signals.try_recv() {
                    outgoing.push((member.id.clone(), message));
                }
            }
            for (from, message) in outgoing {
                progressed = true;
                self.route(&from, message);
            }

            if !progressed {
                return;
            }
        }
        panic!("room did not settle");
    }

    fn route(&self, from: &ParticipantId, message: ClientMessage) {
        match message {
            ClientMessage::WebrtcSignal {
                target_socket_id,
                signal,
                kind,
                reason,
            } => {
                if let Some(target) = self.members.iter().find(|m| m.id == target_socket_id) {
                    target.deliver(ServerMessage::WebrtcSignal {
                        from_socket_id: from.clone(),
                        signal,
                        kind,
                        reason,
                    });
                }
            }
            ClientMessage::StatusChange { media } => {
                for member in self.members.iter().filter(|m| &m.id != from) {
                    member.deliver(ServerMessage::StatusUpdate {
                        id: from.clone(),
                        media,
                    });
                }
            }
            ClientMessage::HangupAll { reason } => {
                for member in &self.members {
                    member.deliver(ServerMessage::ForceDisconnect {
                        reason: reason.clone(),
                        initiated_by: Some(from.clone()),
                    });
                }
            }
            ClientMessage::Ping => {}
        }
    }
}

async fn pair() -> Room {
    let mut room = Room::default();
    room.join(member("a1").await);
    room.join(member("b2").await);
    room.settle().await;
    room
}

#[tokio::test]
async fn two_participants_connect_with_one_offer() {
    let mut room = pair().await;
    let b2 = ParticipantId::from("b2");
    let a1 = ParticipantId::from("a1");

    let a = room.get("a1");
    assert_eq!(a.session.self_id(), Some(&a1));
    assert!(a.session.peers().get(&b2).unwrap().connected);
    assert_eq!(a.peer("b2").offers_created(), 1);
    assert_eq!(
        a.tiles("b2").last(),
        Some(&Tile {
            connected: true,
            video: VideoDisplayState::Off
        })
    );

    let b = room.get("b2");
    assert!(b.session.peers().get(&a1).unwrap().connected);
    assert_eq!(b.peer("a1").offers_created(), 0);
    assert_eq!(b.peer("a1").answers_created(), 1);
    assert!(b.events().contains(&SessionEvent::ParticipantJoined(a1.clone())));
    assert_eq!(
        b.session.presence().get(&a1).map(|r| r.media),
        Some(MediaStatus::new(false, true))
    );
}

#[tokio::test]
async fn camera_toggle_shows_up_on_the_other_side() {
    let mut room = pair().await;

    room.get("a1").command(LocalCommand::SetCamera(true)).await;
    room.settle().await;

    let a = room.get("a1");
    assert_eq!(a.session.local_status(), MediaStatus::new(true, true));
    assert_eq!(a.peer("b2").offers_created(), 2);

    let b = room.get("b2");
    let videos: Vec<VideoDisplayState> = b.tiles("a1").iter().map(|t| t.video).collect();
    assert!(videos.contains(&VideoDisplayState::Waiting));
    assert_eq!(videos.last(), Some(&VideoDisplayState::Live));

    room.get("a1").command(LocalCommand::SetCamera(false)).await;
    room.settle().await;

    let b = room.get("b2");
    assert_eq!(
        b.tiles("a1").last().map(|t| t.video),
        Some(VideoDisplayState::Off)
    );
    assert_eq!(room.get("a1").peer("b2").offers_created(), 3);
}

#[tokio::test]
async fn camera_failure_reverts_toggle() {
    let mut room = Room::default();
    room.join(member_with("a1", SyntheticDevices::new(false, true)).await);
    room.join(member("b2").await);
    room.settle().await;

    let a = room.get("a1");
    a.command(LocalCommand::SetCamera(true)).await;

    assert_eq!(a.session.local_status(), MediaStatus::new(false, true));
    assert!(a.events().iter().any(|e| matches!(
        e,
        SessionEvent::Notice(Notice {
            level: NoticeLevel::Error,
            ..
        })
    )));
    assert_eq!(
        a.events().last(),
        Some(&SessionEvent::LocalMediaChanged(MediaStatus::new(false, true)))
    );
    assert_eq!(a.peer("b2").offers_created(), 1);
}

#[tokio::test]
async fn missing_microphone_aborts_the_session() {
    let (signal_tx, _signals) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let deps = SessionDeps {
        devices: Arc::new(SyntheticDevices::new(true, false)),
        peers: Arc::new(FakeFactory::default()),
        elements: Arc::new(HeadlessElements),
    };

    let result =
        ConferenceSession::create(SessionOptions::default(), deps, signal_tx, event_tx).await;
    assert!(matches!(
        result,
        Err(ClientError::Media(MediaError::NotFound(MediaKind::Audio)))
    ));

    match events.try_recv().unwrap() {
        SessionEvent::Notice(notice) => {
            assert_eq!(notice.level, NoticeLevel::Error);
            assert_eq!(notice.duration, NOTICE_DURATION);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        events.try_recv().unwrap(),
        SessionEvent::Ended(EndReason::MediaUnavailable(MediaError::NotFound(
            MediaKind::Audio
        )))
    );
}

#[tokio::test]
async fn dropped_peer_stays_until_presence_removes_it() {
    let mut room = pair().await;
    let b2 = ParticipantId::from("b2");

    room.get("a1")
        .peer("b2")
        .emit(PeerEvent::IceConnectionState(IceConnectionState::Disconnected));
    room.settle().await;

    let a = room.get("a1");
    assert!(a.session.peers().contains(&b2));
    assert_eq!(
        a.session.tile(&b2),
        Some(Tile {
            connected: false,
            video: VideoDisplayState::Off
        })
    );

    room.leave("b2");
    room.settle().await;

    let a = room.get("a1");
    assert!(a.events().contains(&SessionEvent::ParticipantLeft(b2.clone())));
    assert!(a.peer("b2").is_closed());
    assert!(!a.session.peers().contains(&b2));
    assert_eq!(a.session.tile(&b2), None);

    // A late status from the departed peer must not bring it back.
    a.deliver(ServerMessage::StatusUpdate {
        id: b2.clone(),
        media: MediaStatus::new(true, true).into(),
    });
    room.settle().await;
    assert!(!room.get("a1").session.presence().contains(&b2));
}

#[tokio::test]
async fn inactive_status_from_unknown_participant_creates_nothing() {
    let mut room = Room::default();
    room.join(member("a1").await);
    room.settle().await;

    let stranger = ParticipantId::from("zz9");
    room.get("a1").deliver(ServerMessage::StatusUpdate {
        id: stranger.clone(),
        media: MediaPatch {
            cam: Some(false),
            mic: Some(false),
        },
    });
    room.settle().await;

    let a = room.get("a1");
    assert!(!a.session.presence().contains(&stranger));
    assert_eq!(a.session.tile(&stranger), None);
    assert!(!a.events().contains(&SessionEvent::ParticipantJoined(stranger)));
}

#[tokio::test]
async fn microphone_toggle_is_broadcast() {
    let mut room = pair().await;

    room.get("a1").command(LocalCommand::SetMicrophone(false)).await;
    room.settle().await;

    let b = room.get("b2");
    assert_eq!(
        b.session
            .presence()
            .get(&ParticipantId::from("a1"))
            .map(|r| r.media),
        Some(MediaStatus::new(false, false))
    );
}

#[tokio::test]
async fn hangup_all_ends_every_session() {
    let mut room = pair().await;

    room.get("a1")
        .command(LocalCommand::HangupAll {
            reason: Some("meeting over".to_string()),
        })
        .await;
    room.settle().await;

    for id in ["a1", "b2"] {
        let member = room.get(id);
        assert!(member.ended, "{} still running", id);
        assert!(member.events().contains(&SessionEvent::Ended(
            EndReason::ForceDisconnect {
                reason: Some("meeting over".to_string()),
                initiated_by: Some(ParticipantId::from("a1")),
            }
        )));
        assert!(member.session.peers().is_empty());
        assert_eq!(member.session.local_status(), MediaStatus::default());
    }
    assert!(room.get("a1").peer("b2").is_closed());
    assert!(room.get("b2").peer("a1").is_closed());
}

#[tokio::test]
async fn transport_loss_tears_down_until_next_snapshot() {
    let mut room = pair().await;
    let b2 = ParticipantId::from("b2");

    let a = room.get("a1");
    assert!(a
        .session
        .handle_input(SessionInput::TransportLost)
        .await
        .is_continue());
    assert!(a.session.peers().is_empty());
    assert!(a.session.presence().is_empty());
    assert_eq!(a.session.self_id(), None);
    assert!(a.peer("b2").is_closed());
    assert!(a.events().contains(&SessionEvent::ParticipantLeft(b2.clone())));

    // The reconnect gets a fresh id; the server tells B about both changes.
    let a3 = ParticipantId::from("a3");
    a.id = a3.clone();
    a.deliver(ServerMessage::PresenceSync {
        participants: vec![
            PresenceRecord::new(b2.clone()),
            PresenceRecord::new(a3.clone()),
        ],
        self_id: a3.clone(),
    });
    let b = room.get("b2");
    b.deliver(ServerMessage::left(ParticipantId::from("a1")));
    b.deliver(ServerMessage::joined(PresenceRecord::new(a3.clone())));
    room.settle().await;

    let a = room.get("a3");
    assert_eq!(a.factory.created(), 2);
    assert!(a.session.peers().get(&b2).unwrap().connected);
    assert_eq!(a.peer("b2").offers_created(), 1);

    let b = room.get("b2");
    assert!(b.peer("a1").is_closed());
    assert!(b.session.peers().get(&a3).unwrap().connected);
}
