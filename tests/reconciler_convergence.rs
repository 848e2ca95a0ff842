mod common;

use chat_handover::{
    broadcast::Delivery,
    client::{Change, ClientReconciler, ReconcilerConfig, Surface, Visibility},
    events::Topic,
    service::Draft,
    types::*,
};
use chrono::{DateTime, Utc};

use common::{agent, drain, service, subscribe};

/// Runs a full handover and returns every delivery an admin dashboard saw,
/// plus the authoritative end state.
async fn recorded_handover() -> (Vec<Delivery>, ChatHistory) {
    let service = service();
    let broadcaster = service.broadcaster().clone();
    let mut feed = subscribe(&broadcaster, &[Topic::ActiveChats]).await;

    let chat = service.create_session(Some("visitor-1".into()), Channel::Web).await;
    let id = chat.session_id.as_str();
    let anna = agent("anna");
    let ben = agent("ben");
    let body = |text: &str| AgentMessageBody {
        text: text.into(),
        attachment: None,
    };

    service
        .send_message(id, Draft::visitor("Hi, I need help with my invoice"), Utc::now())
        .await
        .unwrap();
    service
        .send_message(id, Draft::bot("Sure, what is the invoice number?", None), Utc::now())
        .await
        .unwrap();
    service.send_message(id, Draft::visitor("It is 4711"), Utc::now()).await.unwrap();
    service.request_human(id, Utc::now()).await.unwrap();
    service.assign(id, &anna, &anna, Utc::now()).await.unwrap();
    service
        .send_agent_message(id, &anna, body("Hello, Anna here"), Utc::now())
        .await
        .unwrap();
    service.send_message(id, Draft::visitor("ok"), Utc::now()).await.unwrap();
    service.send_message(id, Draft::visitor("ok"), Utc::now()).await.unwrap();
    service
        .transfer(id, None, &ben, &anna, "billing", Utc::now())
        .await
        .unwrap();
    service
        .send_agent_message(id, &ben, body("Ben here, looking at 4711"), Utc::now())
        .await
        .unwrap();
    service
        .close(id, ClosedBy::Agent, Some(&ben), Some("resolved".into()), Utc::now())
        .await
        .unwrap();

    let history = service.get_chat_history(id).await.unwrap();
    (drain(&mut feed), history)
}

fn replay<'a>(deliveries: impl IntoIterator<Item = &'a Delivery>, now: DateTime<Utc>) -> ClientReconciler {
    let mut admin = ClientReconciler::new(Surface::Admin, ReconcilerConfig::default());
    for delivery in deliveries {
        let _ = admin.apply_delivery(delivery, Visibility::Visible, now);
    }
    admin
}

fn assert_converged(client: &ClientReconciler, history: &ChatHistory) {
    let view = client.view(history.chat.session_id()).expect("view exists");
    let ids = view
        .messages
        .iter()
        .map(|entry| entry.message.id.as_str())
        .collect::<Vec<_>>();
    let expected = history.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, expected);
    assert_eq!(view.chat.as_ref(), Some(&history.chat));
}

/// Deterministic Fisher-Yates driven by a small LCG.
fn shuffled(deliveries: &[Delivery], seed: u64) -> Vec<Delivery> {
    let mut out = deliveries.to_vec();
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    for i in (1..out.len()).rev() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        out.swap(i, j);
    }
    out
}

#[tokio::test]
async fn in_order_replay_matches_the_server() {
    let (deliveries, history) = recorded_handover().await;
    assert!(deliveries.len() > 10);
    assert_eq!(history.chat.session.status, ChatStatus::Closed);
    assert_converged(&replay(&deliveries, Utc::now()), &history);
}

#[tokio::test]
async fn repeated_text_keeps_both_messages() {
    let (deliveries, history) = recorded_handover().await;
    let oks = |texts: Vec<&str>| texts.into_iter().filter(|text| *text == "ok").count();
    assert_eq!(oks(history.messages.iter().map(|m| m.text.as_str()).collect()), 2);

    let now = Utc::now();
    let forward = replay(&deliveries, now);
    let reversed = deliveries.iter().rev().cloned().collect::<Vec<_>>();
    let backward = replay(&reversed, now);
    for client in [&forward, &backward] {
        let view = client.view(history.chat.session_id()).expect("view exists");
        assert_eq!(oks(view.texts()), 2);
        assert_converged(client, &history);
    }
}

#[tokio::test]
async fn any_arrival_order_converges() {
    let (deliveries, history) = recorded_handover().await;
    let now = Utc::now();

    let reversed = deliveries.iter().rev().cloned().collect::<Vec<_>>();
    assert_converged(&replay(&reversed, now), &history);

    for seed in 1..=25 {
        assert_converged(&replay(&shuffled(&deliveries, seed), now), &history);
    }
}

#[tokio::test]
async fn duplicated_deliveries_are_idempotent() {
    let (deliveries, history) = recorded_handover().await;
    let doubled = deliveries
        .iter()
        .flat_map(|delivery| [delivery, delivery])
        .collect::<Vec<_>>();
    assert_converged(&replay(doubled, Utc::now()), &history);

    let mut admin = replay(&deliveries, Utc::now());
    for delivery in &deliveries {
        assert!(admin
            .apply_delivery(delivery, Visibility::Visible, Utc::now())
            .is_err());
    }
    assert_converged(&admin, &history);
}

#[tokio::test]
async fn optimistic_echo_converges_whichever_side_lands_first() {
    let service = service();
    let broadcaster = service.broadcaster().clone();
    let chat = service.create_session(None, Channel::Web).await;
    let id = chat.session_id.clone();
    let mut feed = subscribe(&broadcaster, &[Topic::chat(id.as_str())]).await;
    let surface = Surface::Visitor { session_id: id.clone() };

    // Broadcast first, call result second.
    let mut early = ClientReconciler::new(surface.clone(), ReconcilerConfig::default());
    let now = Utc::now();
    let pending = early.begin_send(&id, SenderRole::Visitor, "where is my parcel", now);
    let result = service
        .send_message(&id, Draft::visitor("where is my parcel"), now)
        .await
        .unwrap();
    let deliveries = drain(&mut feed);
    for delivery in &deliveries {
        let _ = early.apply_delivery(delivery, Visibility::Visible, now);
    }
    let late_changes = early.confirm_send(&pending.local_id, &result, now);
    assert!(late_changes.iter().all(|change| !matches!(change, Change::MessageAdded(_))));

    // Call result first, broadcast second.
    let mut late = ClientReconciler::new(surface, ReconcilerConfig::default());
    let pending = late.begin_send(&id, SenderRole::Visitor, "where is my parcel", now);
    late.confirm_send(&pending.local_id, &result, now);
    for delivery in &deliveries {
        assert!(late.apply_delivery(delivery, Visibility::Visible, now).is_err());
    }

    let history = service.get_chat_history(&id).await.unwrap();
    assert_converged(&early, &history);
    assert_converged(&late, &history);
    assert!(early.pending().is_empty());
    assert!(late.pending().is_empty());
}
