use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::money::{Amount, Rate};

/// Error returned when a stored or submitted enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Canonical database and wire representation.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// How backers are compensated for funding a campaign.
    FundingModel, "funding model" {
        Donation => "donation",
        Rewards => "rewards",
        Equity => "equity",
        Debt => "debt",
    }
}

string_enum! {
    /// Lifecycle of a campaign. Only `active` campaigns accept contributions.
    CampaignStatus, "campaign status" {
        Pending => "pending",
        Active => "active",
        Funded => "funded",
        Cancelled => "cancelled",
        Expired => "expired",
        Rejected => "rejected",
    }
}

string_enum! {
    PaymentMethod, "payment method" {
        Card => "card",
        Crypto => "crypto",
        BankTransfer => "bank_transfer",
    }
}

string_enum! {
    /// Only `completed` contributions count towards a campaign balance.
    ContributionStatus, "contribution status" {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Refunded => "refunded",
    }
}

string_enum! {
    UserRole, "user role" {
        User => "user",
        Admin => "admin",
    }
}

/// Platform account created from OIDC claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub role: UserRole,
    pub two_factor_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub title: String,
    pub description: String,
    pub short_description: Option<String>,
    pub image_url: Option<String>,
    pub funding_model: FundingModel,
    pub target_amount: Amount,
    pub current_amount: Amount,
    pub creator_id: String,
    pub status: CampaignStatus,
    pub featured: bool,
    pub approved: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub rewards: Option<Value>,
    pub equity_percentage: Option<Rate>,
    pub interest_rate: Option<Rate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Returns `true` when the campaign is publicly listed and open for funding.
    pub fn accepts_contributions(&self) -> bool {
        self.approved && self.status == CampaignStatus::Active
    }
}

/// Campaign joined with the user who created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignWithCreator {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub creator: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub id: String,
    pub campaign_id: String,
    pub contributor_id: Option<String>,
    pub amount: Amount,
    pub payment_method: PaymentMethod,
    pub payment_id: Option<String>,
    pub contributor_email: Option<String>,
    pub contributor_name: Option<String>,
    pub anonymous: bool,
    pub reward_tier: Option<Value>,
    pub status: ContributionStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Contribution {
    /// Copy suitable for public listings: emails and payment references are
    /// never exposed and anonymous backers lose their name and account link.
    pub fn public_view(&self) -> Self {
        let mut view = self.clone();
        view.contributor_email = None;
        view.payment_id = None;
        if view.anonymous {
            view.contributor_name = None;
            view.contributor_id = None;
        }
        view
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignUpdate {
    pub id: String,
    pub campaign_id: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignComment {
    pub id: String,
    pub campaign_id: String,
    pub user_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentWithUser {
    #[serde(flatten)]
    pub comment: CampaignComment,
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStats {
    pub total_revenue: Amount,
    pub active_campaigns: u64,
    pub total_users: u64,
    pub total_campaigns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyContribution {
    pub date: String,
    pub amount: Amount,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignAnalytics {
    pub total_raised: Amount,
    pub backers_count: u64,
    pub avg_contribution: Amount,
    pub daily_contributions: Vec<DailyContribution>,
}
