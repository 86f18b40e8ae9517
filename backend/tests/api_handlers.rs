mod support;

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use uuid::Uuid;

use enterprise_access::api::policy::{self, AllocateBody, RedeemBody};
use enterprise_access::api::requests::{self, ApproveBody, CreateRequestBody, RequestRef};
use enterprise_access::lock::DistributedLock;
use enterprise_access::requests::model::RequestState;
use enterprise_access::requests::repository::RequestRepository;

use support::{COURSE, Harness};

const LEARNER: i64 = 42;

async fn json_body(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn status<E: IntoResponse>(res: Result<Response, E>) -> StatusCode {
    match res {
        Ok(r) => r.status(),
        Err(e) => e.into_response().status(),
    }
}

fn redeem_body() -> RedeemBody {
    RedeemBody {
        lms_user_id: LEARNER,
        content_key: COURSE.into(),
        metadata: None,
    }
}

#[tokio::test]
async fn redeem_answers_201_then_200() {
    let h = Harness::new().await;
    let p = h.spend_capped_policy(None, None, 10_000, 2_000).await;
    h.lms.link(h.enterprise_uuid, LEARNER);

    let first = policy::redeem(
        State(h.app_state()),
        h.learner(LEARNER),
        Path(p.uuid),
        Json(redeem_body()),
    )
    .await
    .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let tx = json_body(first).await;
    assert_eq!(tx["quantity"], -2_000);

    let second = policy::redeem(
        State(h.app_state()),
        h.learner(LEARNER),
        Path(p.uuid),
        Json(redeem_body()),
    )
    .await
    .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(json_body(second).await["uuid"], tx["uuid"]);
}

#[tokio::test]
async fn denied_redeem_is_422_with_reasons_and_admin_contacts() {
    let h = Harness::new().await;
    let p = h.spend_capped_policy(None, None, 500, 2_000).await;
    h.lms.link(h.enterprise_uuid, LEARNER);
    h.lms.put_customer(
        h.enterprise_uuid,
        enterprise_access::clients::types::EnterpriseCustomerData {
            contact_email: Some("benefits@corp.example".into()),
            admin_users: Vec::new(),
        },
    );

    let err = policy::redeem(
        State(h.app_state()),
        h.learner(LEARNER),
        Path(p.uuid),
        Json(redeem_body()),
    )
    .await
    .unwrap_err();
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = json_body(resp).await;
    assert_eq!(body["error"], "not_enough_value_in_subsidy");
    assert_eq!(body["reasons"][0]["reason"], "not_enough_value_in_subsidy");
    assert_eq!(
        body["reasons"][0]["metadata"]["enterprise_administrators"][0]["email"],
        "benefits@corp.example"
    );
}

#[tokio::test]
async fn lock_contention_is_429() {
    let h = Harness::with_lock_wait(Duration::from_millis(40)).await;
    let p = h.spend_capped_policy(None, None, 10_000, 2_000).await;
    h.lms.link(h.enterprise_uuid, LEARNER);

    let holder = DistributedLock::new(h.lock_store.clone(), Duration::from_secs(30), Duration::ZERO);
    let _guard = holder.acquire(&DistributedLock::policy_key(&p.uuid)).await.unwrap();

    let res = policy::redeem(
        State(h.app_state()),
        h.learner(LEARNER),
        Path(p.uuid),
        Json(redeem_body()),
    )
    .await;
    assert_eq!(status(res), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn unknown_policy_is_404() {
    let h = Harness::new().await;
    let res = policy::retrieve_policy(State(h.app_state()), Path(Uuid::new_v4())).await;
    assert_eq!(status(res), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn can_redeem_needs_a_content_key() {
    let h = Harness::new().await;
    let res = policy::can_redeem(
        State(h.app_state()),
        h.learner(LEARNER),
        Path(h.enterprise_uuid),
        RawQuery(Some("lms_user_id=42".into())),
    )
    .await;
    assert_eq!(status(res), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn can_redeem_accepts_repeated_content_keys() {
    let h = Harness::new().await;
    let p = h.spend_capped_policy(None, None, 10_000, 2_000).await;
    h.lms.link(h.enterprise_uuid, LEARNER);

    let query = format!("content_key={COURSE}&content_key=unknown-course&content_key={COURSE}");
    let resp = policy::can_redeem(
        State(h.app_state()),
        h.learner(LEARNER),
        Path(h.enterprise_uuid),
        RawQuery(Some(query)),
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["can_redeem"], true);
    assert_eq!(entries[0]["redeemable_subsidy_access_policy"]["uuid"], p.uuid.to_string());
    assert_eq!(entries[1]["can_redeem"], false);
    assert_eq!(entries[1]["reasons"][0]["reason"], "content_not_in_catalog");
}

#[tokio::test]
async fn allocate_is_202_and_rejects_empty_batches() {
    let h = Harness::new().await;
    let p = h.assigned_policy(None, 100_000, 2_000).await;

    let resp = policy::allocate(
        State(h.app_state()),
        h.admin(),
        Path(p.uuid),
        Json(AllocateBody {
            learner_emails: vec![" A@Corp.Example ".into(), "b@corp.example".into()],
            content_key: COURSE.into(),
            content_price_cents: -2_000,
        }),
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = json_body(resp).await;
    assert_eq!(body["created"].as_array().unwrap().len(), 2);
    assert_eq!(body["created"][0]["learner_email"], "a@corp.example");

    let res = policy::allocate(
        State(h.app_state()),
        h.admin(),
        Path(p.uuid),
        Json(AllocateBody {
            learner_emails: Vec::new(),
            content_key: COURSE.into(),
            content_price_cents: -2_000,
        }),
    )
    .await;
    assert_eq!(status(res), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn request_lifecycle_over_http() {
    let h = Harness::new().await;
    let p = h.assigned_policy(None, 100_000, 2_000).await;

    let created = requests::create_request(
        State(h.app_state()),
        h.learner(LEARNER),
        Json(CreateRequestBody {
            enterprise_customer_uuid: h.enterprise_uuid,
            policy_uuid: p.uuid,
            course_id: COURSE.into(),
            course_price: 2_000,
        }),
    )
    .await
    .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let request_uuid: Uuid = serde_json::from_value(json_body(created).await["uuid"].clone()).unwrap();

    let duplicate = requests::create_request(
        State(h.app_state()),
        h.learner(LEARNER),
        Json(CreateRequestBody {
            enterprise_customer_uuid: h.enterprise_uuid,
            policy_uuid: p.uuid,
            course_id: COURSE.into(),
            course_price: 2_000,
        }),
    )
    .await;
    assert_eq!(status(duplicate), StatusCode::UNPROCESSABLE_ENTITY);

    let approved = requests::approve(
        State(h.app_state()),
        h.admin(),
        Json(ApproveBody {
            policy_uuid: p.uuid,
            learner_credit_request_uuids: vec![request_uuid],
        }),
    )
    .await
    .unwrap();
    assert_eq!(approved.status(), StatusCode::OK);

    // redeeming through the API moves the request along with the assignment
    let redeemed = policy::redeem(
        State(h.app_state()),
        h.learner(LEARNER),
        Path(p.uuid),
        Json(redeem_body()),
    )
    .await
    .unwrap();
    assert_eq!(redeemed.status(), StatusCode::CREATED);
    let stored = h.requests_repo.fetch_by_id(&request_uuid).await.unwrap().unwrap();
    assert_eq!(stored.state, RequestState::Accepted);

    let cancel = requests::cancel(
        State(h.app_state()),
        h.admin(),
        Json(RequestRef {
            learner_credit_request_uuid: request_uuid,
        }),
    )
    .await;
    assert_eq!(status(cancel), StatusCode::BAD_REQUEST);

    let log = requests::actions(State(h.app_state()), Path(request_uuid)).await.unwrap();
    let log = json_body(log).await;
    let kinds: Vec<&str> = log
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["recent_action"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["requested", "approved", "accepted"]);
}

#[tokio::test]
async fn approval_batch_with_no_successes_is_422() {
    let h = Harness::new().await;
    let p = h.assigned_policy(None, 100_000, 2_000).await;

    let resp = requests::approve(
        State(h.app_state()),
        h.admin(),
        Json(ApproveBody {
            policy_uuid: p.uuid,
            learner_credit_request_uuids: vec![Uuid::new_v4()],
        }),
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(resp).await;
    assert_eq!(body["failed"][0]["error"], "RequestNotFound");
}

#[tokio::test]
async fn list_rejects_unknown_ordering() {
    let h = Harness::new().await;
    let res = requests::list_requests(
        State(h.app_state()),
        Query(requests::ListRequestsParams {
            enterprise_customer_uuid: h.enterprise_uuid,
            state: None,
            latest_action_status: None,
            ordering: Some("-colour".into()),
        }),
    )
    .await;
    assert_eq!(status(res), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn counters_reflect_handled_work() {
    let h = Harness::new().await;
    let p = h.spend_capped_policy(None, None, 10_000, 2_000).await;
    h.lms.link(h.enterprise_uuid, LEARNER);

    policy::redeem(
        State(h.app_state()),
        h.learner(LEARNER),
        Path(p.uuid),
        Json(redeem_body()),
    )
    .await
    .unwrap();

    let Json(snapshot) = enterprise_access::api::counters(State(h.app_state())).await;
    assert_eq!(snapshot.redemptions, 1);
}
