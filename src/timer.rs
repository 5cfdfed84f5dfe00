use serde::{Deserialize, Serialize};

/// Identifies one armed countdown. A token only stays valid until the slot
/// is re-armed or cancelled, so callbacks that outlive their question can
/// be detected and dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimerToken {
    pub question_index: usize,
    generation: u64,
}

/// The single per-question countdown slot of a quiz attempt. At most one
/// countdown is armed at a time; arming replaces the previous countdown
/// synchronously.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QuestionTimer {
    generation: u64,
    armed: Option<Countdown>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct Countdown {
    question_index: usize,
    remaining: u32,
    generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Nothing armed.
    Idle,
    Running { remaining: u32 },
    /// The countdown reached zero and the slot disarmed itself. Fires at
    /// most once per armed countdown.
    Expired(TimerToken),
}

impl QuestionTimer {
    pub fn arm(&mut self, question_index: usize, seconds: u32) -> TimerToken {
        self.generation += 1;
        let token = TimerToken {
            question_index,
            generation: self.generation,
        };
        self.armed = Some(Countdown {
            question_index,
            remaining: seconds,
            generation: self.generation,
        });
        token
    }

    pub fn cancel(&mut self) {
        self.generation += 1;
        self.armed = None;
    }

    pub fn is_live(&self, token: TimerToken) -> bool {
        match &self.armed {
            Some(countdown) => {
                countdown.generation == token.generation
                    && countdown.question_index == token.question_index
            }
            None => false,
        }
    }

    pub fn token(&self) -> Option<TimerToken> {
        self.armed.as_ref().map(|countdown| TimerToken {
            question_index: countdown.question_index,
            generation: countdown.generation,
        })
    }

    pub fn remaining(&self) -> Option<u32> {
        self.armed.as_ref().map(|countdown| countdown.remaining)
    }

    /// Decrements the armed countdown by one second.
    pub fn tick(&mut self) -> Tick {
        let countdown = match &mut self.armed {
            Some(countdown) => countdown,
            None => return Tick::Idle,
        };

        countdown.remaining = countdown.remaining.saturating_sub(1);

        if countdown.remaining == 0 {
            let token = TimerToken {
                question_index: countdown.question_index,
                generation: countdown.generation,
            };
            self.cancel();
            Tick::Expired(token)
        } else {
            Tick::Running {
                remaining: countdown.remaining,
            }
        }
    }

    /// Consumes the slot for an expiry delivered from outside (a scheduled
    /// callback). Returns false when the token is stale, in which case the
    /// caller must treat the expiry as a no-op.
    pub fn expire(&mut self, token: TimerToken) -> bool {
        if self.is_live(token) {
            self.cancel();
            true
        } else {
            false
        }
    }
}
