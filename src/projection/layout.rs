//! # CloudTrail Layout
//!
//! The fixed storage layout trail delivery writes to and the standard
//! CloudTrail record schema.
//!
//! ```text
//! AWSLogs/<account>/CloudTrail/<region>/<year>/<month>/<day>/<file>.json.gz
//! ```

use super::schema::{Column, DataType, StorageFormat};
use super::{PartitionKey, ProjectionRule, TableDefinition, Vocabulary};

/// Region codes trail delivery may write partitions for
pub const AWS_REGIONS: &[&str] = &[
    "ap-south-1",
    "eu-north-1",
    "eu-west-3",
    "eu-west-2",
    "eu-west-1",
    "ap-northeast-3",
    "ap-northeast-2",
    "ap-northeast-1",
    "ca-central-1",
    "sa-east-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "eu-central-1",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
];

/// `AWSLogs/<account>/CloudTrail/`
#[must_use]
pub fn cloudtrail_prefix(account: &str) -> String {
    format!("AWSLogs/{account}/CloudTrail/")
}

/// Location template relative to the bucket root
#[must_use]
pub fn cloudtrail_template(account: &str) -> String {
    format!(
        "{}${{region}}/${{year}}/${{month}}/${{day}}",
        cloudtrail_prefix(account)
    )
}

/// Partition keys in layout order: region, year, month, day
#[must_use]
pub fn cloudtrail_partition_keys(regions: Vec<String>, years: (u32, u32)) -> Vec<PartitionKey> {
    vec![
        PartitionKey::new(
            "region",
            ProjectionRule::Enum {
                values: regions,
                vocabulary: Some(Vocabulary::AwsRegions),
            },
        )
        .with_comment("AWS Region where the API call was made"),
        PartitionKey::new(
            "year",
            ProjectionRule::IntegerRange {
                min: years.0,
                max: years.1,
                digits: None,
            },
        )
        .with_comment("Year of the CloudTrail event"),
        PartitionKey::new(
            "month",
            ProjectionRule::IntegerRange {
                min: 1,
                max: 12,
                digits: Some(2),
            },
        )
        .with_comment("Month of the CloudTrail event"),
        PartitionKey::new(
            "day",
            ProjectionRule::IntegerRange {
                min: 1,
                max: 31,
                digits: Some(2),
            },
        )
        .with_comment("Day of the CloudTrail event"),
    ]
}

fn user_identity() -> DataType {
    let attributes = DataType::structure(vec![
        Column::string("mfaauthenticated"),
        Column::string("creationdate"),
    ]);
    let session_issuer = DataType::structure(vec![
        Column::string("type"),
        Column::string("principalId"),
        Column::string("arn"),
        Column::string("accountId"),
        Column::string("userName"),
    ]);
    DataType::structure(vec![
        Column::string("type"),
        Column::string("principalid"),
        Column::string("arn"),
        Column::string("accountid"),
        Column::string("invokedby"),
        Column::string("accesskeyid"),
        Column::string("userName"),
        Column::new(
            "sessioncontext",
            DataType::structure(vec![
                Column::new("attributes", attributes),
                Column::new("sessionissuer", session_issuer),
            ]),
        ),
    ])
}

/// Standard CloudTrail record columns
#[must_use]
pub fn cloudtrail_columns() -> Vec<Column> {
    vec![
        Column::string("eventversion").with_comment("Version of the CloudTrail event format"),
        Column::new("useridentity", user_identity())
            .with_comment("IAM identity that made the request"),
        Column::string("eventtime").with_comment("Time the request completed, in UTC"),
        Column::string("eventsource").with_comment("Service that received the request"),
        Column::string("eventname").with_comment("API action requested"),
        Column::string("awsregion").with_comment("Region the request was made in"),
        Column::string("sourceipaddress").with_comment("Origin IP address of the request"),
        Column::string("useragent").with_comment("Agent the request was made with"),
        Column::string("errorcode").with_comment("Service error code of a failed request"),
        Column::string("errormessage").with_comment("Error description of a failed request"),
        Column::string("requestparameters").with_comment("Request parameters"),
        Column::string("responseelements").with_comment("Response data of mutating actions"),
        Column::string("additionaleventdata").with_comment("Extra event information"),
        Column::string("requestid").with_comment("Service-generated request id"),
        Column::string("eventid").with_comment("Trail-generated event GUID"),
        Column::new(
            "resources",
            DataType::array(DataType::structure(vec![
                Column::string("ARN"),
                Column::string("accountId"),
                Column::string("type"),
            ])),
        )
        .with_comment("Resources accessed by the event"),
        Column::string("eventtype").with_comment("Event category, e.g. AwsApiCall"),
        Column::string("apiversion").with_comment("API version of AwsApiCall events"),
        Column::string("readonly").with_comment("Whether the operation is read-only"),
        Column::string("recipientaccountid").with_comment("Account that received the event"),
        Column::string("serviceeventdetails").with_comment("Details of service events"),
        Column::string("sharedeventid").with_comment("GUID of events delivered to several accounts"),
        Column::string("vpcendpointid").with_comment("VPC endpoint the request came through"),
    ]
}

/// Table definition over trail delivery output for `account`
#[must_use]
pub fn cloudtrail_table(
    name: impl Into<String>,
    account: &str,
    regions: Vec<String>,
    years: (u32, u32),
) -> TableDefinition {
    TableDefinition {
        name: name.into(),
        description: Some("Cloudtrail logs.".to_string()),
        columns: cloudtrail_columns(),
        partition_keys: cloudtrail_partition_keys(regions, years),
        location_prefix: cloudtrail_prefix(account),
        location_template: cloudtrail_template(account),
        format: StorageFormat::CloudTrail,
        classification: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_follows_delivery_layout() {
        assert_eq!(
            cloudtrail_template("123456789012"),
            "AWSLogs/123456789012/CloudTrail/${region}/${year}/${month}/${day}"
        );
    }

    #[test]
    fn region_vocabulary_has_no_duplicates() {
        let unique: std::collections::HashSet<_> = AWS_REGIONS.iter().collect();
        assert_eq!(unique.len(), AWS_REGIONS.len());
    }
}
