//! Google Calendar API v3 paginated event listing.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::{
    error_for_response, send_with_retry, CalendarProvider, EventPage, EventQuery, ProviderError,
    ProviderEvent, RetryPolicy,
};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

/// events.list rejects `maxResults` above this.
const MAX_PAGE_SIZE: u32 = 2500;

// ----------------------------------------------------------------------------
// Wire format (events.list response)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPage {
    #[serde(default)]
    items: Vec<RawEvent>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(default)]
    id: String,
    summary: Option<String>,
    status: Option<String>,
    start: Option<RawTime>,
    end: Option<RawTime>,
    #[serde(default)]
    attendees: Vec<RawPerson>,
    organizer: Option<RawPerson>,
    hangout_link: Option<String>,
    conference_data: Option<RawConference>,
}

/// Timed events carry `dateTime`; all-day events carry `date`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTime {
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPerson {
    email: Option<String>,
    /// Rooms and equipment show up as attendees with this flag.
    #[serde(default)]
    resource: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConference {
    #[serde(default)]
    entry_points: Vec<RawEntryPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntryPoint {
    entry_point_type: Option<String>,
    uri: Option<String>,
}

impl RawTime {
    fn into_raw(self) -> Option<String> {
        self.date_time.or(self.date)
    }
}

impl From<RawEvent> for ProviderEvent {
    fn from(raw: RawEvent) -> Self {
        let attendees = raw
            .attendees
            .into_iter()
            .filter(|p| !p.resource)
            .filter_map(|p| p.email)
            .filter(|email| !email.trim().is_empty())
            .collect();

        let video_link = raw.conference_data.and_then(|conf| {
            conf.entry_points
                .into_iter()
                .find(|ep| ep.entry_point_type.as_deref() == Some("video"))
                .and_then(|ep| ep.uri)
        });

        ProviderEvent {
            cancelled: raw.status.as_deref() == Some("cancelled"),
            id: raw.id,
            title: raw.summary,
            start: raw.start.and_then(RawTime::into_raw),
            end: raw.end.and_then(RawTime::into_raw),
            attendees,
            organizer: raw
                .organizer
                .and_then(|p| p.email)
                .filter(|email| !email.is_empty()),
            conference_link: video_link.or(raw.hangout_link),
        }
    }
}

impl From<EventsPage> for EventPage {
    fn from(page: EventsPage) -> Self {
        EventPage {
            events: page.items.into_iter().map(ProviderEvent::from).collect(),
            next_page_token: page.next_page_token,
            next_sync_token: page.next_sync_token,
        }
    }
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

/// Calendar v3 client bound to one user's access token.
pub struct GoogleCalendarClient {
    client: reqwest::Client,
    access_token: String,
    base_url: String,
    retry: RetryPolicy,
}

impl GoogleCalendarClient {
    pub fn new(client: reqwest::Client, access_token: String, retry: RetryPolicy) -> Self {
        Self {
            client,
            access_token,
            base_url: DEFAULT_BASE_URL.to_string(),
            retry,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn events_url(&self, calendar_id: &str) -> Result<url::Url, ProviderError> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| ProviderError::Decode(format!("invalid base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Decode("base url cannot carry a path".to_string()))?
            .extend(["calendars", calendar_id, "events"]);
        Ok(url)
    }
}

/// Query string for one events.list call.
///
/// Google refuses `timeMin`, `timeMax` and `orderBy` next to a `syncToken`,
/// and a token only holds while the remaining parameters match the full
/// fetch that issued it.
fn list_params(query: &EventQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("singleEvents", "true".to_string()),
        ("showDeleted", "true".to_string()),
        ("maxResults", query.page_size.clamp(1, MAX_PAGE_SIZE).to_string()),
    ];
    match &query.sync_token {
        Some(token) => params.push(("syncToken", token.clone())),
        None => {
            params.push(("timeMin", query.time_min.to_rfc3339_opts(SecondsFormat::Secs, true)));
            params.push(("timeMax", query.time_max.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
    }
    if let Some(token) = &query.page_token {
        params.push(("pageToken", token.clone()));
    }
    params
}

#[async_trait]
impl CalendarProvider for GoogleCalendarClient {
    /// One page of expanded single events. Cancelled and deleted events come
    /// back flagged rather than dropped. A rejected sync token surfaces as
    /// [`ProviderError::SyncTokenExpired`].
    async fn list_events(&self, query: &EventQuery) -> Result<EventPage, ProviderError> {
        let params = list_params(query);
        let request = self
            .client
            .get(self.events_url(&query.calendar_id)?)
            .bearer_auth(&self.access_token)
            .query(&params);

        let resp = send_with_retry(request, &self.retry).await?;
        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }
        let page: EventsPage = resp.json().await?;
        Ok(page.into())
    }
}

/// Parse a provider time to UTC. All-day dates read as midnight UTC.
pub fn parse_event_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|day| day.and_time(NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn page(json: &str) -> EventPage {
        serde_json::from_str::<EventsPage>(json).unwrap().into()
    }

    #[test]
    fn test_parse_event_datetime() {
        assert_eq!(
            parse_event_datetime("2026-03-10T16:30:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 10, 14, 30, 0).unwrap()
        );
        assert_eq!(
            parse_event_datetime(" 2026-03-10 ").unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap()
        );
        assert!(parse_event_datetime("").is_none());
        assert!(parse_event_datetime("next tuesday").is_none());
    }

    #[test]
    fn test_event_normalization() {
        let page = page(
            r#"{
                "items": [
                    {
                        "id": "qbr-1",
                        "summary": "Globex QBR",
                        "start": {"dateTime": "2026-03-10T16:30:00+02:00"},
                        "end": {"dateTime": "2026-03-10T17:30:00+02:00"},
                        "attendees": [
                            {"email": "ops@globex.com"},
                            {"email": "rep@seller.io", "self": true},
                            {"email": "board-room@resource.calendar.google.com", "resource": true},
                            {"displayName": "No email"}
                        ],
                        "organizer": {"email": "rep@seller.io"},
                        "hangoutLink": "https://meet.google.com/qbr",
                        "conferenceData": {
                            "entryPoints": [
                                {"entryPointType": "phone", "uri": "tel:+1-555-0100"},
                                {"entryPointType": "video", "uri": "https://zoom.us/j/42"}
                            ]
                        }
                    },
                    {"id": "dropped", "status": "cancelled"}
                ],
                "nextSyncToken": "sync-abc"
            }"#,
        );

        assert_eq!(page.next_sync_token.as_deref(), Some("sync-abc"));
        assert!(page.next_page_token.is_none());
        let qbr = &page.events[0];
        assert_eq!(qbr.attendees, vec!["ops@globex.com", "rep@seller.io"]);
        assert_eq!(qbr.organizer.as_deref(), Some("rep@seller.io"));
        assert_eq!(qbr.conference_link.as_deref(), Some("https://zoom.us/j/42"));
        assert_eq!(qbr.start.as_deref(), Some("2026-03-10T16:30:00+02:00"));
        assert!(!qbr.cancelled);
        assert!(page.events[1].cancelled);
    }

    #[test]
    fn test_all_day_event_with_meet_link() {
        let page = page(
            r#"{
                "items": [{
                    "id": "offsite",
                    "start": {"date": "2026-04-01"},
                    "end": {"date": "2026-04-02"},
                    "hangoutLink": "https://meet.google.com/offsite"
                }],
                "nextPageToken": "page-2"
            }"#,
        );
        assert_eq!(page.next_page_token.as_deref(), Some("page-2"));
        let offsite = &page.events[0];
        assert!(offsite.title.is_none());
        assert_eq!(offsite.start.as_deref(), Some("2026-04-01"));
        assert_eq!(
            offsite.conference_link.as_deref(),
            Some("https://meet.google.com/offsite")
        );
    }

    fn query(sync_token: Option<&str>) -> EventQuery {
        EventQuery {
            calendar_id: "primary".to_string(),
            time_min: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            time_max: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
            sync_token: sync_token.map(str::to_string),
            page_token: Some("page-2".to_string()),
            page_size: 9000,
        }
    }

    fn param<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_window_fetch_params() {
        let params = list_params(&query(None));
        assert_eq!(param(&params, "timeMin"), Some("2026-03-01T00:00:00Z"));
        assert_eq!(param(&params, "timeMax"), Some("2026-05-01T00:00:00Z"));
        assert_eq!(param(&params, "showDeleted"), Some("true"));
        assert_eq!(param(&params, "maxResults"), Some("2500"));
        assert_eq!(param(&params, "pageToken"), Some("page-2"));
        assert!(param(&params, "syncToken").is_none());
        assert!(param(&params, "orderBy").is_none());
    }

    #[test]
    fn test_incremental_params_drop_time_bounds() {
        let params = list_params(&query(Some("sync-abc")));
        assert_eq!(param(&params, "syncToken"), Some("sync-abc"));
        assert_eq!(param(&params, "pageToken"), Some("page-2"));
        assert!(param(&params, "timeMin").is_none());
        assert!(param(&params, "timeMax").is_none());
    }

    #[test]
    fn test_events_url_for_shared_calendar() {
        let client = GoogleCalendarClient::new(
            reqwest::Client::new(),
            "token".to_string(),
            RetryPolicy::default(),
        )
        .with_base_url("http://localhost:9999/calendar/v3/");
        let url = client.events_url("team@group.calendar.google.com").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9999/calendar/v3/calendars/team@group.calendar.google.com/events"
        );
    }
}
