use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use once_cell::sync::Lazy;
use reqwest::cookie::Jar;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::config::{Credentials, PortalEndpoints};
use crate::error::PortalError;
use crate::report::{self, AbsenceReport, ProgressDocument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
// How much of an unexpected login page makes it into the error message.
const BODY_SNIPPET_LEN: usize = 500;

static FORM_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("form").expect("static selector is valid"));
static INPUT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input[name]").expect("static selector is valid"));

/// Client for the student portal: performs the identity-provider login and
/// walks the portal API down to the current period's progress document.
pub struct PortalClient {
    /// Follows redirects; used for the login page and all API calls.
    http: reqwest::Client,
    /// Redirects frozen so the credential POST's 302 Location can be read.
    no_redirect: reqwest::Client,
    endpoints: PortalEndpoints,
}

struct LoginForm {
    action: Option<String>,
    fields: HashMap<String, String>,
}

impl PortalClient {
    pub fn new(endpoints: PortalEndpoints) -> Result<Self, PortalError> {
        // Both clients share one cookie jar: the IdP ties the login POST to
        // the session cookie set when the form page is served.
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let no_redirect = reqwest::Client::builder()
            .cookie_provider(jar)
            .redirect(Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            no_redirect,
            endpoints,
        })
    }

    /// Logs in through the identity provider and returns the access token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, PortalError> {
        let resp = self.http.get(&self.endpoints.auth_url).send().await?;
        let status = resp.status();
        let page_url = resp.url().clone();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(PortalError::UnexpectedStatus {
                context: "login page",
                status: status.as_u16(),
            });
        }

        let form = parse_login_form(&body).ok_or_else(|| PortalError::LoginFormMissing {
            status: status.as_u16(),
            url: page_url.to_string(),
            snippet: body_snippet(&body),
        })?;
        let action = form.action.ok_or(PortalError::FormActionMissing)?;
        let action_url = page_url
            .join(&action)
            .map_err(|_| PortalError::FormActionInvalid(action.clone()))?;

        let mut fields = form.fields;
        fields.insert("username".to_string(), username.to_string());
        fields.insert("password".to_string(), password.to_string());

        let post = self.no_redirect.post(action_url).form(&fields).send().await?;
        let status = post.status();
        let location = post
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let location = match (status.as_u16(), location) {
            (302, Some(location)) => location,
            _ => return Err(PortalError::LoginRejected {
                status: status.as_u16(),
            }),
        };

        token_from_redirect(&location).ok_or(PortalError::TokenMissing)
    }

    /// The logged-in student's person UUID, from the `sameAs` field.
    pub async fn fetch_student_uuid(&self, token: &str) -> Result<String, PortalError> {
        let resp = self
            .http
            .get(self.endpoints.me_url())
            .bearer_auth(token)
            .send()
            .await?;
        let resp = check_status(resp, "users/me")?;
        let me: MeResponse = resp.json().await?;

        me.same_as
            .filter(|s| !s.is_empty())
            .ok_or(PortalError::MissingField {
                context: "users/me",
                field: "sameAs",
            })
    }

    /// Resolves the study profile to scrape. An explicit override wins;
    /// otherwise the academic review is scanned for the active profile whose
    /// registration number matches the login username.
    pub async fn resolve_study_profile(
        &self,
        token: &str,
        student_id: &str,
        username: &str,
        override_id: Option<&str>,
    ) -> Result<String, PortalError> {
        if let Some(id) = override_id {
            debug!("Using configured study profile {}", id);
            return Ok(id.to_string());
        }

        let resp = self
            .http
            .post(self.endpoints.academic_review_url(student_id))
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let resp = check_status(resp, "academic-review")?;
        let review: AcademicReview = resp.json().await?;

        if review.profiles.is_empty() {
            return Err(PortalError::MissingField {
                context: "academic-review",
                field: "profiles",
            });
        }

        select_study_profile(&review.profiles, username).ok_or(PortalError::ProfileNotFound)
    }

    /// The period whose convergence window contains now, falling back to the
    /// period with the latest start date.
    pub async fn fetch_current_period_id(
        &self,
        token: &str,
        study_profile_id: &str,
    ) -> Result<String, PortalError> {
        let resp = self
            .http
            .get(self.endpoints.periods_url(study_profile_id))
            .bearer_auth(token)
            .send()
            .await?;
        let resp = check_status(resp, "periods")?;
        let periods: Vec<StudyPeriod> = resp.json().await?;

        select_current_period(&periods, Utc::now()).map(|p| p.id.clone())
    }

    pub async fn fetch_progress(
        &self,
        token: &str,
        period_id: &str,
    ) -> Result<ProgressDocument, PortalError> {
        let resp = self
            .http
            .get(self.endpoints.progress_url(period_id))
            .bearer_auth(token)
            .send()
            .await?;
        let resp = check_status(resp, "progress")?;
        Ok(resp.json().await?)
    }

    /// Runs the whole scrape: login, identity, profile, period, progress,
    /// then summarizes into the served report.
    pub async fn fetch_report(
        &self,
        credentials: &Credentials,
    ) -> Result<AbsenceReport, PortalError> {
        info!("Refreshing absence data from the portal");

        let token = self
            .login(&credentials.username, &credentials.password)
            .await?;
        let student_id = self.fetch_student_uuid(&token).await?;
        let study_profile_id = self
            .resolve_study_profile(
                &token,
                &student_id,
                &credentials.username,
                credentials.profile_override.as_deref(),
            )
            .await?;
        let period_id = self
            .fetch_current_period_id(&token, &study_profile_id)
            .await?;
        let progress = self.fetch_progress(&token, &period_id).await?;

        let absences = report::extract_absences(&progress);
        debug!("Extracted {} course absence entries", absences.len());

        Ok(report::summarize(&absences, Utc::now()))
    }
}

fn check_status(
    resp: reqwest::Response,
    context: &'static str,
) -> Result<reqwest::Response, PortalError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(PortalError::UnexpectedStatus {
            context,
            status: status.as_u16(),
        })
    }
}

// Parsing happens in one synchronous pass so the non-Send DOM never lives
// across an await point.
fn parse_login_form(html: &str) -> Option<LoginForm> {
    let document = Html::parse_document(html);
    let form = document.select(&FORM_SELECTOR).next()?;

    let action = form.value().attr("action").map(str::to_string);
    let mut fields = HashMap::new();
    for input in form.select(&INPUT_SELECTOR) {
        let element = input.value();
        if let Some(name) = element.attr("name") {
            fields.insert(
                name.to_string(),
                element.attr("value").unwrap_or_default().to_string(),
            );
        }
    }

    Some(LoginForm { action, fields })
}

fn token_from_redirect(location: &str) -> Option<String> {
    let url = Url::parse(location).ok()?;
    let fragment = url.fragment()?;
    url::form_urlencoded::parse(fragment.as_bytes())
        .find(|(key, _)| key == "access_token")
        .map(|(_, value)| value.into_owned())
}

fn body_snippet(body: &str) -> String {
    body.chars()
        .take(BODY_SNIPPET_LEN)
        .collect::<String>()
        .replace('\n', " ")
}

#[derive(Deserialize)]
struct MeResponse {
    #[serde(rename = "sameAs", default)]
    same_as: Option<String>,
}

#[derive(Deserialize)]
struct AcademicReview {
    #[serde(default)]
    profiles: Vec<ReviewProfile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewProfile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    active_profile: bool,
    #[serde(default)]
    study: ReviewStudy,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewStudy {
    #[serde(default)]
    trainee_registration_number: Option<String>,
    #[serde(default)]
    assigned_profile_id: Option<String>,
}

fn select_study_profile(profiles: &[ReviewProfile], username: &str) -> Option<String> {
    for profile in profiles {
        if !profile.active_profile {
            continue;
        }
        if profile.study.trainee_registration_number.as_deref() != Some(username) {
            continue;
        }
        if let Some(id) = &profile.id {
            return Some(id.clone());
        }
        if let Some(id) = &profile.study.assigned_profile_id {
            return Some(id.clone());
        }
    }
    None
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudyPeriod {
    id: String,
    #[serde(default)]
    academic_convergence: Option<AcademicConvergence>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcademicConvergence {
    #[serde(default)]
    date_from: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    date_to: Option<DateTime<FixedOffset>>,
}

fn select_current_period(
    periods: &[StudyPeriod],
    now: DateTime<Utc>,
) -> Result<&StudyPeriod, PortalError> {
    for period in periods {
        let Some(conv) = &period.academic_convergence else {
            continue;
        };
        if let (Some(from), Some(to)) = (conv.date_from, conv.date_to) {
            if from.with_timezone(&Utc) <= now && now <= to.with_timezone(&Utc) {
                return Ok(period);
            }
        }
    }

    // Nothing contains now (e.g. between terms): latest start date wins,
    // with undated periods sorting earliest.
    periods
        .iter()
        .max_by_key(|p| {
            p.academic_convergence
                .as_ref()
                .and_then(|c| c.date_from)
                .map(|d| d.with_timezone(&Utc))
        })
        .ok_or(PortalError::NoPeriods)
}
