use std::io::{BufRead, BufReader};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;

use super::{
    ChallengeRequest, DeclineReason, EventStream, GameEvent, IncomingEvent, Platform, StreamEvent, UserProfile,
    parse_stream_line,
};
use crate::error::PlatformError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const NOT_YOUR_TURN: &str = "not your turn";

/// Lichess Bot API client over blocking HTTP.
pub struct LichessClient {
    http: Client,
    /// No overall timeout: event streams stay open for hours.
    stream_http: Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct Account {
    id: String,
}

#[derive(Deserialize)]
struct OnlineBot {
    id: String,
}

impl LichessClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, PlatformError> {
        let user_agent = concat!("rchess-bot/", env!("CARGO_PKG_VERSION"));
        let http = Client::builder().user_agent(user_agent).timeout(REQUEST_TIMEOUT).build()?;
        let stream_http = Client::builder().user_agent(user_agent).timeout(None).build()?;
        Ok(Self {
            http,
            stream_http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token)
    }

    fn open_stream<T>(&self, path: &str) -> Result<EventStream<T>, PlatformError>
    where
        T: StreamEvent + Send + 'static,
    {
        let res = self.stream_http.get(self.url(path)).bearer_auth(&self.token).send()?;
        let res = check_status(res)?;
        Ok(ndjson_stream(BufReader::new(res)))
    }

    fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<(), PlatformError> {
        let res = self.post(path).form(form).send()?;
        check_status(res)?;
        Ok(())
    }
}

/// Maps non-success responses to classified errors.
fn check_status(res: Response) -> Result<Response, PlatformError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(PlatformError::RateLimited);
    }
    let body = res.text().unwrap_or_default();
    Err(PlatformError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Decodes a newline-delimited JSON body lazily, one event per line.
pub(crate) fn ndjson_stream<T, R>(reader: R) -> EventStream<T>
where
    T: StreamEvent + Send + 'static,
    R: BufRead + Send + 'static,
{
    Box::new(reader.lines().map(|line| parse_stream_line(&line?)))
}

impl Platform for LichessClient {
    fn account_id(&self) -> Result<String, PlatformError> {
        let res = check_status(self.get("/api/account").send()?)?;
        let account: Account = serde_json::from_str(&res.text()?)?;
        Ok(account.id)
    }

    fn stream_incoming_events(&self) -> Result<EventStream<IncomingEvent>, PlatformError> {
        self.open_stream("/api/stream/event")
    }

    fn stream_game_state(&self, game_id: &str) -> Result<EventStream<GameEvent>, PlatformError> {
        self.open_stream(&format!("/api/bot/game/stream/{game_id}"))
    }

    fn post_message(&self, game_id: &str, text: &str) -> Result<(), PlatformError> {
        self.post_form(
            &format!("/api/bot/game/{game_id}/chat"),
            &[("room", "player"), ("text", text)],
        )
    }

    fn make_move(&self, game_id: &str, uci: &str) -> Result<(), PlatformError> {
        let res = self.post(&format!("/api/bot/game/{game_id}/move/{uci}")).send()?;
        match check_status(res) {
            Ok(_) => Ok(()),
            Err(PlatformError::Rejected { status, body })
                if status == StatusCode::BAD_REQUEST.as_u16()
                    && body.to_ascii_lowercase().contains(NOT_YOUR_TURN) =>
            {
                Err(PlatformError::NotYourTurn)
            }
            Err(e) => Err(e),
        }
    }

    fn accept_challenge(&self, challenge_id: &str) -> Result<(), PlatformError> {
        self.post_form(&format!("/api/challenge/{challenge_id}/accept"), &[])
    }

    fn decline_challenge(&self, challenge_id: &str, reason: DeclineReason) -> Result<(), PlatformError> {
        self.post_form(
            &format!("/api/challenge/{challenge_id}/decline"),
            &[("reason", reason.as_str())],
        )
    }

    fn create_challenge(&self, target: &str, request: &ChallengeRequest) -> Result<(), PlatformError> {
        let limit = request.clock_limit_secs.to_string();
        let increment = request.increment_secs.to_string();
        self.post_form(
            &format!("/api/challenge/{target}"),
            &[
                ("rated", if request.rated { "true" } else { "false" }),
                ("clock.limit", &limit),
                ("clock.increment", &increment),
            ],
        )
    }

    fn online_bots(&self, limit: usize) -> Result<Vec<String>, PlatformError> {
        let res = check_status(self.get(&format!("/api/bot/online?nb={limit}")).send()?)?;
        let mut ids = Vec::new();
        for line in BufReader::new(res).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let bot: OnlineBot = serde_json::from_str(&line)?;
            ids.push(bot.id);
            if ids.len() >= limit {
                break;
            }
        }
        Ok(ids)
    }

    fn public_data(&self, user_id: &str) -> Result<UserProfile, PlatformError> {
        let res = check_status(self.get(&format!("/api/user/{user_id}")).send()?)?;
        Ok(serde_json::from_str(&res.text()?)?)
    }
}
