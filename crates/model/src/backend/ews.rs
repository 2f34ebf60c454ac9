//! Exchange mailboxes over Exchange Web Services.
//!
//! A service account impersonates the mailbox owner. Folders are listed with
//! one deep `FindFolder`, messages with paged `FindItem` calls per mail
//! folder, and content is fetched with `GetItem` as MIME.

use crate::backend::mail;
use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::http::{check_status, parse_rfc3339, send_throttled};
use crate::manager::SourceManager;
use crate::registry::{Registry, opt_str, str_field};
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_stream::stream;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use trawl_retry::Backoff;

pub const LABEL: &str = "ews";
pub const OFFICE_365_ENDPOINT: &str = "https://outlook.office365.com/EWS/Exchange.asmx";
const PAGE_SIZE: u64 = 100;
/// `PR_ENTRYID`, the identifier the Outlook desktop client opens items by.
const ENTRY_ID_TAG: &str = "0x0FFF";

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, EwsSource::decode);
}

/// One user's mailbox on an Exchange server.
#[derive(Clone, Debug)]
pub struct EwsSource {
    domain: String,
    server: String,
    admin_user: Option<String>,
    admin_password: Option<String>,
    user: String,
}

impl EwsSource {
    pub fn new(domain: impl Into<String>, server: Option<String>, user: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            server: server.unwrap_or_else(|| OFFICE_365_ENDPOINT.to_string()),
            admin_user: None,
            admin_password: None,
            user: user.into(),
        }
    }

    pub fn with_admin(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.admin_user = Some(user.into());
        self.admin_password = Some(password.into());
        self
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self {
            domain: str_field(obj, "domain")?.to_string(),
            server: opt_str(obj, "server").filter(|s| !s.is_empty()).unwrap_or_else(|| OFFICE_365_ENDPOINT.into()),
            admin_user: opt_str(obj, "admin_user").filter(|s| !s.is_empty()),
            admin_password: opt_str(obj, "admin_password").filter(|s| !s.is_empty()),
            user: str_field(obj, "user")?.to_string(),
        }))
    }

    pub fn address(&self) -> String {
        format!("{}@{}", self.user, self.domain)
    }
}

/// A mail folder worth listing.
#[derive(Clone, Debug, PartialEq)]
struct MailFolder {
    id: String,
    name: String,
}

/// One `Folder` or `Message` element of a reply, flattened to its leaf
/// fields.
#[derive(Debug, Default, PartialEq)]
struct Element {
    kind: String,
    id: Option<String>,
    fields: HashMap<String, String>,
}

impl Element {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct Reply {
    /// The first response code other than `NoError`.
    error: Option<String>,
    includes_last: bool,
    elements: Vec<Element>,
}

impl Reply {
    fn into_result(self) -> Result<Self> {
        match self.error.as_deref() {
            None => Ok(self),
            Some(code @ ("ErrorItemNotFound" | "ErrorNonExistentMailbox" | "ErrorFolderNotFound")) => {
                exn::bail!(ErrorKind::NotFound(code.to_string()))
            }
            Some(code @ "ErrorServerBusy") => exn::bail!(ErrorKind::Unavailable(code.to_string())),
            Some(code @ ("ErrorAccessDenied" | "ErrorImpersonateUserDenied")) => {
                exn::bail!(ErrorKind::PermissionDenied(code.to_string()))
            }
            Some(code) => exn::bail!(ErrorKind::InvalidData(format!("EWS error {code}"))),
        }
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn parse_reply(xml: &[u8]) -> Result<Reply> {
    let malformed = |e: String| exn::Exn::from(ErrorKind::InvalidData(format!("malformed EWS reply: {e}")));
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut reply = Reply::default();
    let mut element: Option<Element> = None;
    let mut current: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| malformed(e.to_string()))? {
            Event::Start(e) | Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "Folder" | "Message" => element = Some(Element { kind: name, ..Element::default() }),
                    "FolderId" | "ItemId" => {
                        if let Some(element) = element.as_mut()
                            && element.id.is_none()
                        {
                            element.id = attribute(&e, b"Id");
                        }
                    }
                    "RootFolder" => {
                        reply.includes_last = attribute(&e, b"IncludesLastItemInRange").as_deref() == Some("true");
                    }
                    _ => current = Some(name),
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| malformed(e.to_string()))?.into_owned();
                match (current.as_deref(), element.as_mut()) {
                    (Some(field), Some(element)) => {
                        element.fields.insert(field.to_string(), text);
                    }
                    (Some("ResponseCode"), None) if text != "NoError" && reply.error.is_none() => {
                        reply.error = Some(text);
                    }
                    _ => {},
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"Folder" | b"Message" => reply.elements.extend(element.take()),
                _ => current = None,
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }
    Ok(reply)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Open state: a client speaking SOAP to one server as the service account.
struct EwsClient {
    http: reqwest::Client,
    endpoint: String,
    admin_user: String,
    admin_password: String,
    mailbox: String,
}

impl std::fmt::Debug for EwsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EwsClient").field("endpoint", &self.endpoint).field("mailbox", &self.mailbox).finish_non_exhaustive()
    }
}

impl EwsClient {
    fn envelope(&self, body: &str) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="utf-8"?>"#,
                r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" "#,
                r#"xmlns:t="http://schemas.microsoft.com/exchange/services/2006/types" "#,
                r#"xmlns:m="http://schemas.microsoft.com/exchange/services/2006/messages">"#,
                r#"<soap:Header><t:RequestServerVersion Version="Exchange2013"/>"#,
                r#"<t:ExchangeImpersonation><t:ConnectingSID><t:PrimarySmtpAddress>{mailbox}</t:PrimarySmtpAddress>"#,
                r#"</t:ConnectingSID></t:ExchangeImpersonation></soap:Header>"#,
                r#"<soap:Body>{body}</soap:Body></soap:Envelope>"#
            ),
            mailbox = escape(&self.mailbox),
            body = body
        )
    }

    /// Posts one request, retrying while the server reports itself busy.
    async fn call(&self, body: &str) -> Result<Reply> {
        let envelope = self.envelope(body);
        let busy = Backoff::default().max_tries(5).fuzz(0.25);
        busy.run_if(
            || async {
                let response = send_throttled(|| {
                    self.http
                        .post(&self.endpoint)
                        .basic_auth(&self.admin_user, Some(&self.admin_password))
                        .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
                        .body(envelope.clone())
                })
                .await?;
                // SOAP faults arrive as 500s with a parseable body.
                let response = if response.status().as_u16() == 500 { response } else { check_status(response)? };
                let body = response.bytes().await.map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))?;
                parse_reply(&body)?.into_result()
            },
            |kind| matches!(kind, ErrorKind::Unavailable(_)),
        )
        .await
    }

    /// Every mail folder below the message root that has messages in it.
    async fn mail_folders(&self) -> Result<Vec<MailFolder>> {
        let body = concat!(
            r#"<m:FindFolder Traversal="Deep"><m:FolderShape><t:BaseShape>IdOnly</t:BaseShape>"#,
            r#"<t:AdditionalProperties><t:FieldURI FieldURI="folder:DisplayName"/>"#,
            r#"<t:FieldURI FieldURI="folder:FolderClass"/><t:FieldURI FieldURI="folder:TotalCount"/>"#,
            r#"</t:AdditionalProperties></m:FolderShape><m:ParentFolderIds>"#,
            r#"<t:DistinguishedFolderId Id="msgfolderroot"/></m:ParentFolderIds></m:FindFolder>"#
        );
        let reply = self.call(body).await?;
        Ok(reply
            .elements
            .into_iter()
            .filter(|f| f.field("FolderClass") == Some("IPF.Note"))
            .filter(|f| f.field("TotalCount").and_then(|c| c.parse::<u64>().ok()).unwrap_or_default() > 0)
            .filter_map(|f| Some(MailFolder { name: f.field("DisplayName").unwrap_or_default().to_string(), id: f.id? }))
            .collect())
    }

    /// One page of a folder's messages, and whether it was the last.
    async fn find_messages(&self, folder: &str, offset: u64) -> Result<(Vec<Element>, bool)> {
        let body = format!(
            concat!(
                r#"<m:FindItem Traversal="Shallow"><m:ItemShape><t:BaseShape>IdOnly</t:BaseShape>"#,
                r#"<t:AdditionalProperties><t:FieldURI FieldURI="item:Subject"/>"#,
                r#"<t:ExtendedFieldURI PropertyTag="{tag}" PropertyType="Binary"/>"#,
                r#"</t:AdditionalProperties></m:ItemShape>"#,
                r#"<m:IndexedPageItemView MaxEntriesReturned="{size}" Offset="{offset}" BasePoint="Beginning"/>"#,
                r#"<m:ParentFolderIds><t:FolderId Id="{folder}"/></m:ParentFolderIds></m:FindItem>"#
            ),
            tag = ENTRY_ID_TAG,
            size = PAGE_SIZE,
            offset = offset,
            folder = escape(folder)
        );
        let reply = self.call(&body).await?;
        let last = reply.includes_last || reply.elements.is_empty();
        Ok((reply.elements, last))
    }

    async fn get_message(&self, id: &str, with_content: bool) -> Result<Element> {
        let body = format!(
            concat!(
                r#"<m:GetItem><m:ItemShape><t:BaseShape>IdOnly</t:BaseShape>"#,
                r#"<t:IncludeMimeContent>{mime}</t:IncludeMimeContent>"#,
                r#"<t:AdditionalProperties><t:FieldURI FieldURI="item:Size"/>"#,
                r#"<t:FieldURI FieldURI="item:DateTimeCreated"/><t:FieldURI FieldURI="item:DateTimeReceived"/>"#,
                r#"<t:FieldURI FieldURI="item:DateTimeSent"/></t:AdditionalProperties></m:ItemShape>"#,
                r#"<m:ItemIds><t:ItemId Id="{id}"/></m:ItemIds></m:GetItem>"#
            ),
            mime = with_content,
            id = escape(id)
        );
        let reply = self.call(&body).await?;
        reply.elements.into_iter().next().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(id.to_string())))
    }
}

#[async_trait]
impl Source for EwsSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    /// The server is left out so that a mailbox is the same source whichever
    /// endpoint reaches it.
    fn eq_properties(&self) -> Value {
        json!({"domain": self.domain, "user": self.user})
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self { admin_user: None, admin_password: None, ..self.clone() })
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("domain".into(), self.domain.clone().into());
        obj.insert("server".into(), self.server.clone().into());
        obj.insert("admin_user".into(), self.admin_user.clone().into());
        obj.insert("admin_password".into(), self.admin_password.clone().into());
        obj.insert("user".into(), self.user.clone().into());
        obj
    }

    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        let (Some(admin_user), Some(admin_password)) = (self.admin_user.clone(), self.admin_password.clone()) else {
            exn::bail!(ErrorKind::Unauthorized(format!("no service account for {}", self.address())));
        };
        Ok(Opened::new(EwsClient {
            http: sm.http().client()?,
            endpoint: self.server.clone(),
            admin_user,
            admin_password,
            mailbox: self.address(),
        }))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        Box::pin(stream! {
            let client = match sm.open_as::<EwsClient>(self.as_ref()).await {
                Ok(client) => client,
                Err(e) => { yield Err(e); return; }
            };
            let folders = match client.mail_folders().await {
                Ok(folders) => folders,
                Err(e) => { yield Err(e); return; }
            };
            let source: SourceRef = self.clone();
            for folder in folders {
                let mut offset = 0;
                loop {
                    let (messages, last) = match client.find_messages(&folder.id, offset).await {
                        Ok(page) => page,
                        Err(e) => { yield Err(e); break; }
                    };
                    offset += messages.len() as u64;
                    for message in messages.into_iter().filter(|m| m.kind == "Message") {
                        // Items Outlook can't open have no entry id.
                        let Some(entry_id) = message.field("Value").and_then(|v| STANDARD.decode(v).ok()) else {
                            continue;
                        };
                        let Some(id) = message.id.as_deref() else { continue };
                        let subject = message.field("Subject").unwrap_or("(no subject)");
                        yield Ok(Handle::new(source.clone(), format!("{}.{id}", folder.id))
                            .with_extra("mail_subject", subject)
                            .with_extra("folder_name", folder.name.clone())
                            .with_extra("entry_id", hex(&entry_id)));
                    }
                    if last {
                        break;
                    }
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(EwsResource { handle: handle.clone(), source: self.clone(), sm, message: OnceCell::new() })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        mail::MIME.to_string()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        format!("\"{}\"", handle.extra_str("mail_subject").unwrap_or_default())
    }

    fn presentation_place(&self, handle: &Handle) -> String {
        format!("folder {} of account {}", handle.extra_str("folder_name").unwrap_or_default(), self.address())
    }

    /// Only Office 365 has a web link for arbitrary items; elsewhere the
    /// Outlook client can at least open the entry id.
    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        if self.server == OFFICE_365_ENDPOINT {
            let (_, message_id) = handle.relative_path.split_once('.')?;
            let encoded: String = url::form_urlencoded::byte_serialize(message_id.as_bytes()).collect();
            Some(format!("https://outlook.office365.com/owa/?ItemID={encoded}&exvsurl=1&viewmodel=ReadMessageItem"))
        } else {
            handle.extra_str("entry_id").map(|id| format!("outlook:{id}"))
        }
    }

    fn sort_key(&self, handle: &Handle) -> String {
        let folder = handle.extra_str("folder_name").unwrap_or_default().trim_start_matches('/');
        format!(
            "{}/{}/{}/{}",
            self.domain,
            self.user,
            if folder.is_empty() { "(unknown folder)" } else { folder },
            handle.extra_str("mail_subject").unwrap_or_default()
        )
    }
}

struct EwsResource<'a> {
    handle: Handle,
    source: EwsSource,
    sm: &'a SourceManager,
    message: OnceCell<Element>,
}

impl EwsResource<'_> {
    fn message_id(&self) -> Result<&str> {
        match self.handle.relative_path.split_once('.') {
            Some((_, id)) => Ok(id),
            None => exn::bail!(ErrorKind::Deserialize(format!("`{}` is not a folder.item path", self.handle.relative_path))),
        }
    }

    async fn message(&self) -> Result<&Element> {
        self.message
            .get_or_try_init(|| async {
                let client = self.sm.open_as::<EwsClient>(&self.source).await?;
                client.get_message(self.message_id()?, true).await
            })
            .await
    }
}

#[async_trait]
impl Resource for EwsResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        let client = self.sm.open_as::<EwsClient>(&self.source).await?;
        match client.get_message(self.message_id()?, false).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_missing() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.message().await?.field("Size").and_then(|s| s.parse().ok()).unwrap_or_default())
    }

    /// The latest of the creation, receipt and send times.
    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        let message = self.message().await?;
        Ok(["DateTimeCreated", "DateTimeReceived", "DateTimeSent"]
            .iter()
            .filter_map(|f| message.field(f).and_then(parse_rfc3339))
            .max())
    }

    async fn compute_type(&self) -> Result<String> {
        Ok(mail::MIME.to_string())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let content = self.message().await?.field("MimeContent").unwrap_or_default();
        let mime = STANDARD
            .decode(content)
            .map_err(|e| exn::Exn::from(ErrorKind::InvalidData(format!("undecodable MIME content: {e}"))))?;
        Ok(cursor(mime))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let mut metadata = Map::new();
        metadata.insert("email-account".into(), self.source.address().into());
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const FIND_FOLDER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
<m:FindFolderResponse xmlns:m="http://schemas.microsoft.com/exchange/services/2006/messages"
  xmlns:t="http://schemas.microsoft.com/exchange/services/2006/types">
<m:ResponseMessages><m:FindFolderResponseMessage ResponseClass="Success">
<m:ResponseCode>NoError</m:ResponseCode>
<m:RootFolder TotalItemsInView="3" IncludesLastItemInRange="true"><t:Folders>
<t:Folder><t:FolderId Id="AAInbox" ChangeKey="x"/><t:FolderClass>IPF.Note</t:FolderClass>
  <t:DisplayName>Inbox</t:DisplayName><t:TotalCount>12</t:TotalCount></t:Folder>
<t:Folder><t:FolderId Id="AAEmpty"/><t:FolderClass>IPF.Note</t:FolderClass>
  <t:DisplayName>Archive</t:DisplayName><t:TotalCount>0</t:TotalCount></t:Folder>
<t:Folder><t:FolderId Id="AAContacts"/><t:FolderClass>IPF.Contact</t:FolderClass>
  <t:DisplayName>Contacts</t:DisplayName><t:TotalCount>40</t:TotalCount></t:Folder>
</t:Folders></m:RootFolder></m:FindFolderResponseMessage></m:ResponseMessages>
</m:FindFolderResponse></s:Body></s:Envelope>"#;

    const FIND_ITEM: &str = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
<m:FindItemResponse xmlns:m="m" xmlns:t="t"><m:ResponseMessages>
<m:FindItemResponseMessage ResponseClass="Success"><m:ResponseCode>NoError</m:ResponseCode>
<m:RootFolder IndexedPagingOffset="2" TotalItemsInView="2" IncludesLastItemInRange="true"><t:Items>
<t:Message><t:ItemId Id="AAMsg1" ChangeKey="c"/><t:Subject>Salaries &amp; bonuses</t:Subject>
  <t:ExtendedProperty><t:ExtendedFieldURI PropertyTag="0xfff" PropertyType="Binary"/><t:Value>AAEC/w==</t:Value></t:ExtendedProperty>
</t:Message>
<t:MeetingRequest><t:ItemId Id="AAMeet"/></t:MeetingRequest>
</t:Items></m:RootFolder></m:FindItemResponseMessage></m:ResponseMessages></m:FindItemResponse></s:Body></s:Envelope>"#;

    fn source() -> Arc<EwsSource> {
        Arc::new(EwsSource::new("example.invalid", None, "carol").with_admin("svc@example.invalid", "hunter2"))
    }

    #[test]
    fn test_find_folder_reply() {
        let reply = parse_reply(FIND_FOLDER.as_bytes()).unwrap().into_result().unwrap();
        assert_eq!(reply.elements.len(), 3);
        assert!(reply.includes_last);
        assert_eq!(reply.elements[0].id.as_deref(), Some("AAInbox"));
        assert_eq!(reply.elements[0].field("DisplayName"), Some("Inbox"));
        assert_eq!(reply.elements[2].field("FolderClass"), Some("IPF.Contact"));
    }

    #[test]
    fn test_find_item_reply() {
        let reply = parse_reply(FIND_ITEM.as_bytes()).unwrap().into_result().unwrap();
        assert_eq!(reply.elements.len(), 1);
        let message = &reply.elements[0];
        assert_eq!(message.kind, "Message");
        assert_eq!(message.id.as_deref(), Some("AAMsg1"));
        assert_eq!(message.field("Subject"), Some("Salaries & bonuses"));
        assert_eq!(hex(&STANDARD.decode(message.field("Value").unwrap()).unwrap()), "000102FF");
    }

    #[rstest]
    #[case("ErrorItemNotFound", "NotFound")]
    #[case("ErrorNonExistentMailbox", "NotFound")]
    #[case("ErrorServerBusy", "Unavailable")]
    #[case("ErrorAccessDenied", "PermissionDenied")]
    #[case("ErrorInvalidRequest", "InvalidData")]
    fn test_response_codes(#[case] code: &str, #[case] expected: &str) {
        let xml = format!(
            r#"<Envelope><Body><GetItemResponse><ResponseMessages>
            <GetItemResponseMessage ResponseClass="Error"><MessageText>no</MessageText>
            <ResponseCode>{code}</ResponseCode><Items/></GetItemResponseMessage>
            </ResponseMessages></GetItemResponse></Body></Envelope>"#
        );
        let err = parse_reply(xml.as_bytes()).unwrap().into_result().unwrap_err();
        assert_eq!(err.name(), expected);
    }

    #[test]
    fn test_envelope_escapes_mailbox() {
        let client = EwsClient {
            http: reqwest::Client::new(),
            endpoint: OFFICE_365_ENDPOINT.into(),
            admin_user: "svc".into(),
            admin_password: "pw".into(),
            mailbox: "o'neil&co@example.invalid".into(),
        };
        let envelope = client.envelope("<m:GetItem/>");
        assert!(envelope.contains("<t:PrimarySmtpAddress>o&apos;neil&amp;co@example.invalid</t:PrimarySmtpAddress>"));
        assert!(envelope.ends_with("<soap:Body><m:GetItem/></soap:Body></soap:Envelope>"));
    }

    #[test]
    fn test_presentation() {
        let handle = Handle::new(source(), "AAInbox.AA+Msg/1=")
            .with_extra("mail_subject", "Hello")
            .with_extra("folder_name", "Inbox")
            .with_extra("entry_id", "000102FF");
        assert_eq!(handle.presentation_name(), "\"Hello\"");
        assert_eq!(handle.presentation_place(), "folder Inbox of account carol@example.invalid");
        assert_eq!(
            handle.presentation_url().as_deref(),
            Some("https://outlook.office365.com/owa/?ItemID=AA%2BMsg%2F1%3D&exvsurl=1&viewmodel=ReadMessageItem")
        );
        assert_eq!(handle.sort_key(), "example.invalid/carol/Inbox/Hello");

        let on_prem = Arc::new(EwsSource::new("example.invalid", Some("https://mail.example.invalid/EWS/Exchange.asmx".into()), "carol"));
        let handle = Handle::new(on_prem, "AAInbox.AAMsg1").with_extra("entry_id", "000102FF");
        assert_eq!(handle.presentation_url().as_deref(), Some("outlook:000102FF"));
        assert_eq!(handle.sort_key(), "example.invalid/carol/(unknown folder)/");
    }

    #[test]
    fn test_round_trip_and_censor() {
        let registry = Registry::default();
        let handle = Handle::new(source(), "AAInbox.AAMsg1").with_extra("mail_subject", "Hello");
        let decoded = registry.decode_handle(&handle.to_json()).unwrap();
        assert_eq!(decoded, handle);
        let censored = handle.censor();
        assert_eq!(censored.to_json()["source"]["admin_password"], Value::Null);
        assert_eq!(censored, handle);
    }

    #[tokio::test]
    async fn test_censored_source_cannot_open() {
        let sm = SourceManager::default();
        let censored = source().censor();
        let err = sm.open(censored.as_ref()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unauthorized(_)));
    }
}
