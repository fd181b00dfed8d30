use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mock_cimom::{app, app_with_auth};
use tower::ServiceExt;

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn request_body(method: &str, namespace_xml: &str, params: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n\
         <CIM CIMVERSION=\"2.0\" DTDVERSION=\"2.0\">\
         <MESSAGE ID=\"1001\" PROTOCOLVERSION=\"1.0\"><SIMPLEREQ>\
         <IMETHODCALL NAME=\"{method}\">\
         <LOCALNAMESPACEPATH>{namespace_xml}</LOCALNAMESPACEPATH>\
         {params}\
         </IMETHODCALL></SIMPLEREQ></MESSAGE></CIM>"
    )
}

fn cim_request(method: &str, params: &str) -> Request<String> {
    let body = request_body(
        method,
        "<NAMESPACE NAME=\"root\"/><NAMESPACE NAME=\"cimv2\"/>",
        params,
    );
    Request::builder()
        .method("POST")
        .uri("/cimom")
        .header("Content-Type", "application/xml; charset=\"utf-8\"")
        .header("CIMOperation", "MethodCall")
        .header("CIMMethod", method)
        .header("CIMObject", "root/cimv2")
        .body(body)
        .unwrap()
}

// --- basic envelope behavior ---

#[tokio::test]
async fn missing_cim_operation_header_is_rejected() {
    let resp = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/cimom")
                .body(String::new())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn replies_echo_the_message_id_and_mark_method_response() {
    let resp = app()
        .oneshot(cim_request("EnumerateInstanceNames",
            "<IPARAMVALUE NAME=\"ClassName\"><CLASSNAME NAME=\"Mock_Person\"/></IPARAMVALUE>"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("CIMOperation").unwrap(),
        "MethodResponse"
    );
    assert!(resp.headers().contains_key("WBEMServerResponseTime"));
    let body = body_text(resp).await;
    assert!(body.contains("<MESSAGE ID=\"1001\""));
}

// --- instance operations ---

#[tokio::test]
async fn get_instance_returns_the_seeded_person() {
    let params = "<IPARAMVALUE NAME=\"InstanceName\">\
                  <INSTANCENAME CLASSNAME=\"Mock_Person\">\
                  <KEYBINDING NAME=\"Name\"><KEYVALUE VALUETYPE=\"string\">Fritz</KEYVALUE></KEYBINDING>\
                  </INSTANCENAME></IPARAMVALUE>";
    let resp = app().oneshot(cim_request("GetInstance", params)).await.unwrap();
    let body = body_text(resp).await;
    assert!(body.contains("<VALUE>Fritz Town</VALUE>"));
    assert!(!body.contains("<ERROR"));
}

#[tokio::test]
async fn get_instance_unknown_key_is_not_found() {
    let params = "<IPARAMVALUE NAME=\"InstanceName\">\
                  <INSTANCENAME CLASSNAME=\"Mock_Person\">\
                  <KEYBINDING NAME=\"Name\"><KEYVALUE VALUETYPE=\"string\">Nobody</KEYVALUE></KEYBINDING>\
                  </INSTANCENAME></IPARAMVALUE>";
    let resp = app().oneshot(cim_request("GetInstance", params)).await.unwrap();
    let body = body_text(resp).await;
    assert!(body.contains("<ERROR CODE=\"6\""));
}

#[tokio::test]
async fn enumerate_instances_returns_both_seeds() {
    let params = "<IPARAMVALUE NAME=\"ClassName\"><CLASSNAME NAME=\"Mock_Person\"/></IPARAMVALUE>";
    let resp = app()
        .oneshot(cim_request("EnumerateInstances", params))
        .await
        .unwrap();
    let body = body_text(resp).await;
    assert_eq!(body.matches("<VALUE.NAMEDINSTANCE>").count(), 2);
    assert!(body.contains("Wonderland"));
}

#[tokio::test]
async fn unknown_namespace_maps_to_code_3() {
    let body = request_body(
        "EnumerateInstances",
        "<NAMESPACE NAME=\"root\"/><NAMESPACE NAME=\"bad\"/>",
        "<IPARAMVALUE NAME=\"ClassName\"><CLASSNAME NAME=\"Mock_Person\"/></IPARAMVALUE>",
    );
    let req = Request::builder()
        .method("POST")
        .uri("/cimom")
        .header("CIMOperation", "MethodCall")
        .body(body)
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    let body = body_text(resp).await;
    assert!(body.contains("<ERROR CODE=\"3\""));
}

#[tokio::test]
async fn unknown_method_maps_to_code_7() {
    let resp = app().oneshot(cim_request("FrobnicateInstances", "")).await.unwrap();
    let body = body_text(resp).await;
    assert!(body.contains("<ERROR CODE=\"7\""));
}

// --- pull enumeration ---

#[tokio::test]
async fn open_then_pull_walks_the_store() {
    use tower::Service;
    let mut app = app().into_service();

    let open_params =
        "<IPARAMVALUE NAME=\"ClassName\"><CLASSNAME NAME=\"Mock_Person\"/></IPARAMVALUE>\
         <IPARAMVALUE NAME=\"MaxObjectCount\"><VALUE>1</VALUE></IPARAMVALUE>";
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(cim_request("OpenEnumerateInstances", open_params))
        .await
        .unwrap();
    let body = body_text(resp).await;
    assert_eq!(body.matches("<VALUE.INSTANCEWITHPATH>").count(), 1);
    assert!(body.contains("<PARAMVALUE NAME=\"EndOfSequence\" PARAMTYPE=\"boolean\"><VALUE>FALSE</VALUE>"));

    let ctx_start = body.find("<PARAMVALUE NAME=\"EnumerationContext\"><VALUE>").unwrap()
        + "<PARAMVALUE NAME=\"EnumerationContext\"><VALUE>".len();
    let ctx_end = body[ctx_start..].find("</VALUE>").unwrap() + ctx_start;
    let ctx = &body[ctx_start..ctx_end];

    let pull_params = format!(
        "<IPARAMVALUE NAME=\"EnumerationContext\"><VALUE>{ctx}</VALUE></IPARAMVALUE>\
         <IPARAMVALUE NAME=\"MaxObjectCount\"><VALUE>5</VALUE></IPARAMVALUE>"
    );
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(cim_request("PullInstancesWithPath", &pull_params))
        .await
        .unwrap();
    let body = body_text(resp).await;
    assert_eq!(body.matches("<VALUE.INSTANCEWITHPATH>").count(), 1);
    assert!(body.contains("<VALUE>TRUE</VALUE>"));

    // the context is spent
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(cim_request("PullInstancesWithPath", &pull_params))
        .await
        .unwrap();
    let body = body_text(resp).await;
    assert!(body.contains("<ERROR CODE=\"21\""));
}

// --- authentication ---

#[tokio::test]
async fn auth_guard_rejects_missing_credentials() {
    let resp = app_with_auth("tester", "secret")
        .oneshot(cim_request("EnumerateInstances", ""))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().contains_key("WWW-Authenticate"));
}

#[tokio::test]
async fn auth_guard_accepts_matching_credentials() {
    // "tester:secret" base64-encoded
    let mut req = cim_request(
        "EnumerateInstanceNames",
        "<IPARAMVALUE NAME=\"ClassName\"><CLASSNAME NAME=\"Mock_Person\"/></IPARAMVALUE>",
    );
    req.headers_mut().insert(
        "Authorization",
        "Basic dGVzdGVyOnNlY3JldA==".parse().unwrap(),
    );
    let resp = app_with_auth("tester", "secret").oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_text(resp).await;
    assert!(body.contains("<INSTANCENAME CLASSNAME=\"Mock_Person\">"));
}
