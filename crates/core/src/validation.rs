//! Request payload validation.
//!
//! Inputs are deserialized permissively (every field optional, numeric fields
//! as raw JSON values) so that every problem can be reported at once as a list
//! of [`FieldError`]s instead of failing on the first bad field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::money::{Amount, Rate};
use crate::types::{ContributionStatus, FundingModel, PaymentMethod};

const TITLE_MAX: usize = 255;
const SHORT_DESCRIPTION_MAX: usize = 500;
const COMMENT_MAX: usize = 5_000;
const PAYMENT_ID_MAX: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

/// Collection of field level problems found in a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{} invalid field(s)", .errors.len())]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    fn push(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            path: path.to_string(),
            message: message.into(),
        });
    }

    fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub image_url: Option<String>,
    pub funding_model: Option<String>,
    pub target_amount: Option<Value>,
    pub end_date: Option<String>,
    pub category: Option<String>,
    pub rewards: Option<Value>,
    pub equity_percentage: Option<Value>,
    pub interest_rate: Option<Value>,
}

/// Campaign fields accepted from a creator. Moderation fields are never
/// taken from the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidCampaign {
    pub title: String,
    pub description: String,
    pub short_description: Option<String>,
    pub image_url: Option<String>,
    pub funding_model: FundingModel,
    pub target_amount: Amount,
    pub end_date: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub rewards: Option<Value>,
    pub equity_percentage: Option<Rate>,
    pub interest_rate: Option<Rate>,
}

impl CampaignInput {
    pub fn validate(self, now: DateTime<Utc>) -> Result<ValidCampaign, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        let title = required_text(&mut errors, "title", self.title, TITLE_MAX);
        let description = required_text(&mut errors, "description", self.description, usize::MAX);
        let short_description = optional_text(
            &mut errors,
            "shortDescription",
            self.short_description,
            SHORT_DESCRIPTION_MAX,
        );

        let funding_model = match self.funding_model.as_deref().map(str::trim) {
            None | Some("") => {
                errors.push("fundingModel", "Funding model is required");
                None
            }
            Some(raw) => match raw.parse::<FundingModel>() {
                Ok(model) => Some(model),
                Err(_) => {
                    errors.push(
                        "fundingModel",
                        "Funding model must be one of donation, rewards, equity, debt",
                    );
                    None
                }
            },
        };

        let target_amount = positive_amount(&mut errors, "targetAmount", self.target_amount.as_ref());

        let end_date = match non_blank(self.end_date) {
            None => None,
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(parsed) => {
                    let parsed = parsed.with_timezone(&Utc);
                    if parsed <= now {
                        errors.push("endDate", "End date must be in the future");
                    }
                    Some(parsed)
                }
                Err(_) => {
                    errors.push("endDate", "End date must be an RFC 3339 timestamp");
                    None
                }
            },
        };

        let equity_percentage = optional_rate(&mut errors, "equityPercentage", self.equity_percentage.as_ref());
        let interest_rate = optional_rate(&mut errors, "interestRate", self.interest_rate.as_ref());

        if let Some(model) = funding_model {
            if equity_percentage.is_some() && model != FundingModel::Equity {
                errors.push("equityPercentage", "Only equity campaigns offer an equity percentage");
            }
            if interest_rate.is_some() && model != FundingModel::Debt {
                errors.push("interestRate", "Only debt campaigns offer an interest rate");
            }
            if model == FundingModel::Equity && equity_percentage.is_none() {
                errors.push("equityPercentage", "Equity campaigns must state an equity percentage");
            }
        }

        let rewards = match self.rewards {
            None | Some(Value::Null) => None,
            Some(value @ Value::Array(_)) => {
                if funding_model.is_some_and(|model| model != FundingModel::Rewards) {
                    errors.push("rewards", "Only rewards campaigns can define reward tiers");
                }
                Some(value)
            }
            Some(_) => {
                errors.push("rewards", "Rewards must be a list of reward tiers");
                None
            }
        };

        let campaign = match (title, description, funding_model, target_amount) {
            (Some(title), Some(description), Some(funding_model), Some(target_amount)) => {
                Some(ValidCampaign {
                    title,
                    description,
                    short_description,
                    image_url: non_blank(self.image_url),
                    funding_model,
                    target_amount,
                    end_date,
                    category: non_blank(self.category),
                    rewards,
                    equity_percentage,
                    interest_rate,
                })
            }
            _ => None,
        };

        match campaign {
            Some(campaign) => errors.into_result(campaign),
            None => Err(errors),
        }
    }
}

/// Body of the direct (non-gateway) contribution endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionInput {
    pub amount: Option<Value>,
    pub payment_method: Option<String>,
    pub payment_id: Option<String>,
    pub contributor_email: Option<String>,
    pub contributor_name: Option<String>,
    pub anonymous: Option<bool>,
    pub reward_tier: Option<Value>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidContribution {
    pub amount: Amount,
    pub payment_method: PaymentMethod,
    pub payment_id: Option<String>,
    pub contributor_email: Option<String>,
    pub contributor_name: Option<String>,
    pub anonymous: bool,
    pub reward_tier: Option<Value>,
    pub status: ContributionStatus,
}

impl ContributionInput {
    pub fn validate(self) -> Result<ValidContribution, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        let amount = positive_amount(&mut errors, "amount", self.amount.as_ref());

        let payment_method = match self.payment_method.as_deref().map(str::trim) {
            None | Some("") => {
                errors.push("paymentMethod", "Payment method is required");
                None
            }
            Some(raw) => match raw.parse::<PaymentMethod>() {
                Ok(PaymentMethod::Card) => {
                    errors.push(
                        "paymentMethod",
                        "Card payments must be started through /api/payments/initialize",
                    );
                    None
                }
                Ok(method) => Some(method),
                Err(_) => {
                    errors.push("paymentMethod", "Payment method must be crypto or bank_transfer");
                    None
                }
            },
        };

        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => Some(ContributionStatus::Completed),
            Some(raw) => match raw.parse::<ContributionStatus>() {
                Ok(status @ (ContributionStatus::Pending | ContributionStatus::Completed)) => {
                    Some(status)
                }
                _ => {
                    errors.push("status", "Status must be pending or completed");
                    None
                }
            },
        };

        let payment_id = optional_text(&mut errors, "paymentId", self.payment_id, PAYMENT_ID_MAX);
        let contributor_email = optional_email(&mut errors, "contributorEmail", self.contributor_email);

        match (amount, payment_method, status) {
            (Some(amount), Some(payment_method), Some(status)) => errors.into_result(ValidContribution {
                amount,
                payment_method,
                payment_id,
                contributor_email,
                contributor_name: non_blank(self.contributor_name),
                anonymous: self.anonymous.unwrap_or(false),
                reward_tier: self.reward_tier.filter(|value| !value.is_null()),
                status,
            }),
            _ => Err(errors),
        }
    }
}

/// Body of `POST /api/payments/initialize`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInitInput {
    pub amount: Option<Value>,
    pub email: Option<String>,
    pub campaign_id: Option<String>,
    pub name: Option<String>,
    pub anonymous: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPaymentInit {
    pub amount: Amount,
    pub email: String,
    pub campaign_id: String,
    pub name: Option<String>,
    pub anonymous: bool,
}

impl PaymentInitInput {
    pub fn validate(self) -> Result<ValidPaymentInit, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let amount = positive_amount(&mut errors, "amount", self.amount.as_ref());
        let email = match optional_email(&mut errors, "email", self.email) {
            Some(email) => Some(email),
            None => {
                if errors.errors.iter().all(|err| err.path != "email") {
                    errors.push("email", "Email is required");
                }
                None
            }
        };
        let campaign_id = non_blank(self.campaign_id);
        if campaign_id.is_none() {
            errors.push("campaignId", "Campaign id is required");
        }

        match (amount, email, campaign_id) {
            (Some(amount), Some(email), Some(campaign_id)) => errors.into_result(ValidPaymentInit {
                amount,
                email,
                campaign_id,
                name: non_blank(self.name),
                anonymous: self.anonymous.unwrap_or(false),
            }),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateInput {
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidUpdate {
    pub title: String,
    pub content: String,
}

impl UpdateInput {
    pub fn validate(self) -> Result<ValidUpdate, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let title = required_text(&mut errors, "title", self.title, TITLE_MAX);
        let content = required_text(&mut errors, "content", self.content, usize::MAX);
        match (title, content) {
            (Some(title), Some(content)) => errors.into_result(ValidUpdate { title, content }),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentInput {
    pub content: Option<String>,
}

impl CommentInput {
    pub fn validate(self) -> Result<String, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        match required_text(&mut errors, "content", self.content, COMMENT_MAX) {
            Some(content) => errors.into_result(content),
            None => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminLoginInput {
    pub username: Option<String>,
    pub password: Option<String>,
    pub two_factor_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidAdminLogin {
    pub username: String,
    pub password: String,
    pub two_factor_code: Option<String>,
}

impl AdminLoginInput {
    pub fn validate(self) -> Result<ValidAdminLogin, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let username = non_blank(self.username);
        if username.is_none() {
            errors.push("username", "Username is required");
        }
        // Passwords are compared verbatim, so only emptiness is checked.
        let password = self.password.filter(|value| !value.is_empty());
        if password.is_none() {
            errors.push("password", "Password is required");
        }
        match (username, password) {
            (Some(username), Some(password)) => errors.into_result(ValidAdminLogin {
                username,
                password,
                two_factor_code: non_blank(self.two_factor_code),
            }),
            _ => Err(errors),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

fn required_text(
    errors: &mut ValidationErrors,
    path: &str,
    value: Option<String>,
    max_chars: usize,
) -> Option<String> {
    match non_blank(value) {
        None => {
            errors.push(path, format!("{} is required", display_name(path)));
            None
        }
        Some(text) if text.chars().count() > max_chars => {
            errors.push(path, format!("Must be at most {max_chars} characters"));
            None
        }
        Some(text) => Some(text),
    }
}

fn optional_text(
    errors: &mut ValidationErrors,
    path: &str,
    value: Option<String>,
    max_chars: usize,
) -> Option<String> {
    let text = non_blank(value)?;
    if text.chars().count() > max_chars {
        errors.push(path, format!("Must be at most {max_chars} characters"));
        return None;
    }
    Some(text)
}

fn optional_email(errors: &mut ValidationErrors, path: &str, value: Option<String>) -> Option<String> {
    let email = non_blank(value)?;
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        errors.push(path, "Must be a valid email address");
        return None;
    }
    Some(email)
}

fn positive_amount(errors: &mut ValidationErrors, path: &str, value: Option<&Value>) -> Option<Amount> {
    let Some(value) = value.filter(|value| !value.is_null()) else {
        errors.push(path, format!("{} is required", display_name(path)));
        return None;
    };
    match Amount::from_json(value) {
        Ok(amount) if amount.is_zero() => {
            errors.push(path, "Must be greater than zero");
            None
        }
        Ok(amount) => Some(amount),
        Err(err) => {
            errors.push(path, format!("Invalid amount: {err}"));
            None
        }
    }
}

fn optional_rate(errors: &mut ValidationErrors, path: &str, value: Option<&Value>) -> Option<Rate> {
    let value = value.filter(|value| !value.is_null())?;
    match Rate::from_json(value) {
        Ok(rate) => Some(rate),
        Err(err) => {
            errors.push(path, format!("Invalid percentage: {err}"));
            None
        }
    }
}

fn display_name(path: &str) -> String {
    let mut chars = path.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
