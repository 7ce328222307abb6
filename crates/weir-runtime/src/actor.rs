use std::fmt;
use std::future::Future;

use log::{error, warn};
use tokio::sync::{mpsc, watch};

const ACTOR_CHANNEL_SIZE: usize = 8;

pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options;
    type Error: From<mpsc::error::SendError<Self::Message>> + fmt::Display;

    fn new(options: Self::Options) -> Self;
    fn start(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), Self::Error>;
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;
    fn stop(self) -> Result<(), Self::Error>;
}

pub enum ActorAction {
    Continue,
    Warn(String),
    Fail(String),
    Stop,
}

impl ActorAction {
    pub fn warn(message: impl ToString) -> Self {
        ActorAction::Warn(message.to_string())
    }

    pub fn fail(message: impl ToString) -> Self {
        ActorAction::Fail(message.to_string())
    }
}

pub struct ActorContext<T>
where
    T: Actor,
{
    handle: ActorHandle<T>,
}

impl<T: Actor> ActorContext<T> {
    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}

pub struct ActorHandle<T>
where
    T: Actor,
{
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T> Clone for ActorHandle<T>
where
    T: Actor,
{
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub fn new(options: T::Options) -> Self {
        let (tx, mut rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let mut actor = T::new(options);
        let out = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let handle = out.clone();
        tokio::spawn(async move {
            let mut ctx = ActorContext { handle };
            if let Err(e) = actor.start(&mut ctx) {
                error!("failed to start actor: {e}");
                let _ = stopped_tx.send(true);
                return;
            }
            while let Some(message) = rx.recv().await {
                match actor.receive(&mut ctx, message) {
                    ActorAction::Continue => {}
                    ActorAction::Warn(message) => {
                        warn!("{message}");
                    }
                    ActorAction::Fail(message) => {
                        error!("{message}");
                    }
                    ActorAction::Stop => {
                        break;
                    }
                }
            }
            if let Err(e) = actor.stop() {
                error!("failed to stop actor: {e}");
            }
            let _ = stopped_tx.send(true);
        });
        out
    }

    pub async fn send(&self, message: T::Message) -> Result<(), T::Error> {
        self.sender.send(message).await.map_err(T::Error::from)
    }

    pub async fn wait_for_stop(mut self) {
        // We ignore the receiver error since the sender must have been dropped
        // in this case, which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}
