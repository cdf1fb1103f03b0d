use livekit_components::{
    agent::AGENT_STATE_ATTRIBUTE,
    prelude::*,
    room::{
        loopback::{LoopbackRoom, LoopbackServer},
        StreamWriter,
    },
    transcriptions::{SEGMENT_ID_ATTRIBUTE, TRANSCRIPTION_TOPIC},
};
use std::{collections::HashMap, error::Error, sync::Arc, time::Duration};
use tokio::time::sleep;

// Run a session against an in-process room with a scripted agent
// and print the conversation as it evolves

static QUESTIONS: &[&str] = &["Hello?", "What can you do?"];
static ANSWER: &[&str] = &["I", " can", " answer", " questions", " about", " the", " weather."];

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let server = LoopbackServer::default();
    let room = server.room(ParticipantInfo::new("user", ParticipantKind::Standard));
    let session = Session::new(
        room,
        TokenSourceLiteral::from_parts("loopback://demo", "demo-token"),
        SessionOptions::default(),
    )?;
    session.start().await?;
    println!("Connected, waiting for the agent…");

    let agent = tokio::spawn(run_agent(server.clone()));
    let state = session.wait_until_agent_available().await?;
    println!("Agent is available ({:?})", state);

    let mut updates = session.messages().messages().updates();
    let printer = tokio::spawn(async move {
        while let Some(messages) = updates.recv().await {
            println!("--- {} message(s)", messages.len());
            for message in messages.iter() {
                let sender = message.sender.as_ref().map_or("?", |s| s.as_str());
                println!("[{:?}] {}: {}", message.kind, sender, message.text);
            }
        }
    });

    for question in QUESTIONS {
        session.send(*question).await?;
        sleep(Duration::from_secs(2)).await;
    }

    session.end().await?;
    agent.abort();
    printer.abort();
    Ok(())
}

async fn run_agent(server: LoopbackServer) -> Result<(), Box<dyn Error + Send + Sync>> {
    sleep(Duration::from_millis(500)).await;
    let info = ParticipantInfo::new("agent", ParticipantKind::Agent)
        .with_attributes(state_attributes("initializing"));
    let room = server.room(info);
    room.connect("loopback://demo", "agent-token").await?;
    let chat = Chat::new(room.clone(), ChatOptions::default())?;

    sleep(Duration::from_millis(500)).await;
    room.set_attributes(state_attributes("listening"));

    let mut messages = chat.messages().updates();
    let mut answered = 0;
    while let Some(log) = messages.recv().await {
        for message in log.iter().skip(answered) {
            println!("(agent heard '{}')", message.message);
            answer(&room, &format!("segment-{}", answered)).await?;
            answered += 1;
        }
    }
    Ok(())
}

async fn answer(
    room: &Arc<LoopbackRoom>,
    segment: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    room.set_attributes(state_attributes("thinking"));
    sleep(Duration::from_millis(300)).await;
    room.set_attributes(state_attributes("speaking"));

    let options = StreamTextOptions {
        topic: TRANSCRIPTION_TOPIC.to_owned(),
        attributes: [(SEGMENT_ID_ATTRIBUTE.to_owned(), segment.to_owned())].into(),
        ..Default::default()
    };
    let writer = room.stream_text(options).await?;
    for word in ANSWER {
        writer.write(*word).await?;
        sleep(Duration::from_millis(100)).await;
    }
    writer.close().await?;

    room.set_attributes(state_attributes("listening"));
    Ok(())
}

fn state_attributes(state: &str) -> HashMap<String, String> {
    [(AGENT_STATE_ATTRIBUTE.to_owned(), state.to_owned())].into()
}
