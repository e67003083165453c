use serde::Serialize;

pub const FREE_PLAN_NAME: &str = "free";
/// Limit used when not even the free plan can be found in the catalog.
pub const FREE_PLAN_FALLBACK_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub name: String,
    pub monthly_resource_limit: i64,
    pub price_monthly_cents: i64,
    pub price_yearly_cents: i64,
    pub features: Vec<String>,
    pub is_active: bool,
}

impl Plan {
    /// The plans seeded by the initial migration.
    pub fn defaults() -> Vec<Plan> {
        vec![
            Plan {
                name: FREE_PLAN_NAME.into(),
                monthly_resource_limit: FREE_PLAN_FALLBACK_LIMIT,
                price_monthly_cents: 0,
                price_yearly_cents: 0,
                features: vec!["Basic AI processing".into(), "100 emails/month".into()],
                is_active: true,
            },
            Plan {
                name: "pro".into(),
                monthly_resource_limit: 500,
                price_monthly_cents: 1999,
                price_yearly_cents: 19999,
                features: vec![
                    "Advanced AI processing".into(),
                    "500 emails/month".into(),
                    "Priority support".into(),
                ],
                is_active: true,
            },
            Plan {
                name: "enterprise".into(),
                monthly_resource_limit: 2000,
                price_monthly_cents: 4999,
                price_yearly_cents: 49999,
                features: vec![
                    "All features".into(),
                    "2000 emails/month".into(),
                    "Custom integrations".into(),
                    "Dedicated support".into(),
                ],
                is_active: true,
            },
        ]
    }
}

pub(crate) fn split_features(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(String::from)
        .collect()
}
